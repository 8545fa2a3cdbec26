// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transaction log replay.
//!
//! Replay walks the log from the beginning and hands every complete
//! transaction to the caller in order. It stops at the first transaction that
//! cannot be read in full:
//!
//! - Running out of bytes anywhere inside a transaction is a torn tail. The
//!   transaction is dropped in both modes.
//! - Bytes that are present but wrong (unknown marker, bad separator,
//!   unknown operation type, negative count) fail the open in strict mode and
//!   are treated like a torn tail in lenient mode.
//!
//! Either way the log must be rewritten before new transactions are appended
//! after it, so the summary asks for a trim.

use bytes::Buf;
use tracing::{debug, warn};

use crate::{
    error::{LogCorruptedSnafu, Result},
    operation::{Operation, OperationType},
    txlog::{END_MARKER, MARKER_SIZE, OPERATION_SEPARATOR, OPERATION_SIZE, START_MARKER},
};

/// Outcome of a successful replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Complete transactions applied.
    pub transactions: u32,
    /// The log holds dequeues, reinstates or an unreadable tail and should be
    /// rewritten.
    pub needs_trim:   bool,
}

#[derive(Debug)]
enum Fault {
    Truncated,
    Malformed(String),
}

type Decoded<T> = std::result::Result<T, Fault>;

/// Replays `log`, calling `apply` once per complete transaction.
pub fn replay<F>(log: &[u8], strict: bool, mut apply: F) -> Result<ReplaySummary>
where
    F: FnMut(&[Operation]),
{
    let mut buf = log;
    let mut summary = ReplaySummary::default();

    while buf.has_remaining() {
        let offset = log.len() - buf.remaining();
        match read_transaction(&mut buf) {
            Ok(operations) => {
                if operations.iter().any(|op| op.kind != OperationType::Enqueue) {
                    summary.needs_trim = true;
                }
                apply(&operations);
                summary.transactions += 1;
            }
            Err(Fault::Truncated) => {
                warn!(
                    offset,
                    transaction = summary.transactions + 1,
                    "Dropping torn transaction at end of log"
                );
                summary.needs_trim = true;
                break;
            }
            Err(Fault::Malformed(reason)) => {
                if strict {
                    return LogCorruptedSnafu {
                        transaction: summary.transactions + 1,
                        reason,
                    }
                    .fail();
                }
                warn!(
                    offset,
                    transaction = summary.transactions + 1,
                    %reason,
                    "Malformed transaction log, ignoring the rest of it"
                );
                summary.needs_trim = true;
                break;
            }
        }
    }

    debug!(
        transactions = summary.transactions,
        needs_trim = summary.needs_trim,
        "Transaction log replayed"
    );
    Ok(summary)
}

fn read_transaction(buf: &mut &[u8]) -> Decoded<Vec<Operation>> {
    read_marker(buf, &START_MARKER, "start")?;

    if buf.remaining() < 4 {
        return Err(Fault::Truncated);
    }
    let count = buf.get_i32_le();
    let count = usize::try_from(count)
        .map_err(|_| Fault::Malformed(format!("negative operation count {count}")))?;

    let mut operations = Vec::with_capacity(count.min(buf.remaining() / OPERATION_SIZE));
    for _ in 0..count {
        operations.push(read_operation(buf)?);
    }

    read_marker(buf, &END_MARKER, "end")?;
    Ok(operations)
}

fn read_marker(buf: &mut &[u8], expected: &[u8; MARKER_SIZE], which: &str) -> Decoded<()> {
    if buf.remaining() < MARKER_SIZE {
        return Err(Fault::Truncated);
    }
    let mut marker = [0u8; MARKER_SIZE];
    buf.copy_to_slice(&mut marker);

    if marker == *expected {
        return Ok(());
    }
    let found = if marker == START_MARKER {
        "start marker"
    } else if marker == END_MARKER {
        "end marker"
    } else {
        "unrecognized bytes"
    };
    Err(Fault::Malformed(format!("expected {which} marker, found {found}")))
}

fn read_operation(buf: &mut &[u8]) -> Decoded<Operation> {
    if buf.remaining() < 4 {
        return Err(Fault::Truncated);
    }
    let separator = buf.get_u32_le();
    if separator != OPERATION_SEPARATOR {
        return Err(Fault::Malformed(format!(
            "bad operation separator {separator:#010x}"
        )));
    }

    if buf.remaining() < OPERATION_SIZE - 4 {
        return Err(Fault::Truncated);
    }
    let tag = buf.get_u8();
    let kind = OperationType::try_from(tag)
        .map_err(|_| Fault::Malformed(format!("unknown operation type {tag}")))?;

    Ok(Operation::new(
        kind,
        buf.get_i32_le(),
        buf.get_i32_le(),
        buf.get_i32_le(),
    ))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::txlog::encode_transaction;

    fn log_of(transactions: &[&[Operation]]) -> Vec<u8> {
        transactions
            .iter()
            .flat_map(|ops| encode_transaction(ops).unwrap())
            .collect()
    }

    fn collect(log: &[u8], strict: bool) -> Result<(Vec<Vec<Operation>>, ReplaySummary)> {
        let mut seen = Vec::new();
        let summary = replay(log, strict, |ops| seen.push(ops.to_vec()))?;
        Ok((seen, summary))
    }

    #[test]
    fn test_empty_log() {
        let (seen, summary) = collect(&[], true).unwrap();
        assert!(seen.is_empty());
        assert_eq!(summary, ReplaySummary::default());
    }

    #[test]
    fn test_clean_enqueue_log_needs_no_trim() {
        let log = log_of(&[&[Operation::enqueue(0, 0, 1)], &[Operation::enqueue(0, 1, 2)]]);
        let (seen, summary) = collect(&log, true).unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec![Operation::enqueue(0, 1, 2)]);
        assert_eq!(summary.transactions, 2);
        assert!(!summary.needs_trim);
    }

    #[test]
    fn test_dequeue_forces_trim() {
        let dequeue = Operation::new(OperationType::Dequeue, 0, 0, 1);
        let log = log_of(&[&[Operation::enqueue(0, 0, 1)], &[dequeue]]);
        let (_, summary) = collect(&log, true).unwrap();
        assert!(summary.needs_trim);
    }

    #[test_case(true ; "strict")]
    #[test_case(false ; "lenient")]
    fn test_torn_tail_is_dropped(strict: bool) {
        let ops = [Operation::enqueue(0, 0, 1)];
        let mut log = log_of(&[&ops, &ops, &ops]);

        for cut in [1, 5, 16, 17, 30, 40] {
            let torn = &log[..log.len() - cut];
            let (seen, summary) = collect(torn, strict).unwrap();
            assert_eq!(seen.len(), 2, "cut {cut}");
            assert!(summary.needs_trim);
        }

        log.truncate(log.len() - (log.len() / 3) + 3);
        let (seen, _) = collect(&log, strict).unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_garbage_fails_strict() {
        let mut log = log_of(&[&[Operation::enqueue(0, 0, 1)]]);
        log.extend_from_slice(&[0xde; 64]);

        let err = collect(&log, true).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("#2"));

        let (seen, summary) = collect(&log, false).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(summary.needs_trim);
    }

    #[test]
    fn test_end_marker_in_start_position() {
        let mut log = log_of(&[&[Operation::enqueue(0, 0, 1)]]);
        log.extend_from_slice(&END_MARKER);
        log.extend_from_slice(&[0; 8]);

        let err = collect(&log, true).unwrap_err();
        assert!(err.to_string().contains("found end marker"));
    }

    #[test]
    fn test_bad_separator() {
        let mut log = log_of(&[&[Operation::enqueue(0, 0, 1)]]);
        log[20] ^= 0xff;
        assert!(collect(&log, true).unwrap_err().is_corruption());

        let (seen, _) = collect(&log, false).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn test_unknown_operation_type() {
        let mut log = log_of(&[&[Operation::enqueue(0, 0, 1)]]);
        log[24] = 9;
        let err = collect(&log, true).unwrap_err();
        assert!(err.to_string().contains("unknown operation type 9"));
    }

    #[test]
    fn test_marker_valued_fields_are_not_framing() {
        // Payload bytes never reach the log, but positions that happen to
        // spell marker bytes must still decode as plain integers.
        let fields = i32::from_le_bytes([0x12, 0xfb, 0x5b, 0xb7]);
        let ops = [Operation::enqueue(fields, fields, fields)];
        let log = log_of(&[&ops, &ops]);

        let (seen, summary) = collect(&log, true).unwrap();
        assert_eq!(seen, vec![ops.to_vec(), ops.to_vec()]);
        assert!(!summary.needs_trim);
    }
}
