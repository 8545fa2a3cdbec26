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

//! Data file manager.
//!
//! The [`Appender`] owns the write head: the current data file number and the
//! next write position in it. Every session write goes through
//! [`Appender::append`], which reserves space under the writer lock, records
//! where each payload lands, and hands the bytes to the
//! [`IOWorker`](crate::io_worker::IOWorker). Rollover happens here too: once
//! the position reaches `max_file_size` the head moves to the next file.
//!
//! Commands are sent while the writer lock is held, so the worker sees them
//! in head order.
//!
//! Space handed out by `append` stays reserved until the owning session
//! commits or discards it. A data file with reservations is never deleted,
//! even when none of its committed items are left.

use std::{collections::HashMap, io, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tracing::debug;

use crate::{
    error::{PayloadTooLargeSnafu, Result, WorkerStoppedSnafu, WriteTimeoutSnafu},
    io_worker::WriteCommand,
    operation::{Operation, OperationType},
};

/// Current data file and the next write position in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteHead {
    pub file_number: i32,
    pub position:    i64,
}

/// Writes reserved by one [`Appender::append`] call.
#[derive(Debug)]
pub struct InFlightWrite {
    /// One enqueue per payload, in payload order.
    pub operations: Vec<Operation>,
    done:           Receiver<io::Result<()>>,
    writes:         usize,
}

impl InFlightWrite {
    /// Waits for every write of this batch. Each failed write contributes one
    /// error; the outer error means the wait itself gave up.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<io::Error>> {
        let mut failures = Vec::new();
        for _ in 0..self.writes {
            if let Err(e) = recv_done(&self.done, timeout)? {
                failures.push(e);
            }
        }
        Ok(failures)
    }
}

/// Waits for a completion signal from the worker.
pub fn recv_done<T>(rx: &Receiver<T>, timeout: Duration) -> Result<T> {
    use crossbeam::channel::RecvTimeoutError;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => WriteTimeoutSnafu { waited: timeout }.fail(),
        Err(RecvTimeoutError::Disconnected) => WorkerStoppedSnafu.fail(),
    }
}

#[derive(Debug)]
struct WriterState {
    head:     WriteHead,
    tx:       Option<Sender<WriteCommand>>,
    /// Uncommitted enqueues per data file.
    reserved: HashMap<i32, usize>,
}

/// Reserves data file space and forwards writes to the I/O worker.
#[derive(Debug)]
pub struct Appender {
    state:         Mutex<WriterState>,
    max_file_size: i64,
}

impl Appender {
    pub fn new(head: WriteHead, tx: Sender<WriteCommand>, max_file_size: u32) -> Self {
        Self {
            state:         Mutex::new(WriterState {
                head,
                tx: Some(tx),
                reserved: HashMap::new(),
            }),
            max_file_size: i64::from(max_file_size),
        }
    }

    /// Snapshot of the write head.
    pub fn head(&self) -> WriteHead { self.state.lock().head }

    /// Reserves space for `payloads` and sends them to the worker.
    ///
    /// Consecutive payloads share one write until the head rolls over to a
    /// new file. An empty batch reserves nothing and sends nothing.
    pub fn append(&self, payloads: &[Bytes]) -> Result<InFlightWrite> {
        for payload in payloads {
            ensure!(
                i32::try_from(payload.len()).is_ok(),
                PayloadTooLargeSnafu {
                    length: payload.len(),
                }
            );
        }

        let (done_tx, done) = unbounded();
        let mut operations = Vec::with_capacity(payloads.len());
        let mut writes = 0;

        let mut state = self.state.lock();
        let tx = state.tx.clone().context(WorkerStoppedSnafu)?;

        let mut chunk = BytesMut::new();
        let mut chunk_start = state.head;

        for payload in payloads {
            let file_number = state.head.file_number;
            #[allow(clippy::cast_possible_truncation)]
            operations.push(Operation::enqueue(
                file_number,
                state.head.position as i32,
                payload.len() as i32,
            ));
            *state.reserved.entry(file_number).or_insert(0) += 1;
            chunk.put_slice(payload);
            state.head.position += payload.len() as i64;

            if state.head.position >= self.max_file_size {
                writes += send_chunk(&tx, chunk_start, &mut chunk, &done_tx)?;

                let preallocate = state.head.position.unsigned_abs();
                state.head = WriteHead {
                    file_number: state.head.file_number + 1,
                    position:    0,
                };
                chunk_start = state.head;
                debug!(
                    file_number = state.head.file_number,
                    "Rolling over to next data file"
                );
                tx.send(WriteCommand::Roll {
                    file_number: state.head.file_number,
                    preallocate,
                })
                .ok()
                .context(WorkerStoppedSnafu)?;
            }
        }
        writes += send_chunk(&tx, chunk_start, &mut chunk, &done_tx)?;

        Ok(InFlightWrite {
            operations,
            done,
            writes,
        })
    }

    /// Gives back the space of enqueues that were committed or abandoned.
    pub fn unreserve(&self, operations: &[Operation]) {
        let mut state = self.state.lock();
        for op in operations.iter().filter(|op| op.kind == OperationType::Enqueue) {
            if let Some(count) = state.reserved.get_mut(&op.file_number) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.reserved.remove(&op.file_number);
                }
            }
        }
    }

    /// Whether an uncommitted enqueue still points into `file_number`.
    pub fn is_reserved(&self, file_number: i32) -> bool {
        self.state.lock().reserved.contains_key(&file_number)
    }

    /// Asks the worker to force all written data to disk.
    pub fn sync(&self) -> Result<Receiver<io::Result<()>>> {
        let (done, rx) = unbounded();
        self.send(WriteCommand::Sync { done })?;
        Ok(rx)
    }

    /// Makes the worker close its data files and waits for it.
    pub fn release_files(&self, timeout: Duration) -> Result<()> {
        let (done, rx) = unbounded();
        self.send(WriteCommand::Release { done })?;
        recv_done(&rx, timeout)
    }

    /// Moves the write head and forgets all reservations, e.g. after the
    /// queue was wiped.
    pub fn reset(&self, head: WriteHead) {
        let mut state = self.state.lock();
        state.head = head;
        state.reserved.clear();
    }

    /// Drops the channel to the worker. The worker drains what was already
    /// sent and exits.
    pub fn close(&self) { self.state.lock().tx = None; }

    fn send(&self, command: WriteCommand) -> Result<()> {
        let state = self.state.lock();
        let tx = state.tx.as_ref().context(WorkerStoppedSnafu)?;
        tx.send(command).ok().context(WorkerStoppedSnafu)
    }
}

fn send_chunk(
    tx: &Sender<WriteCommand>,
    start: WriteHead,
    chunk: &mut BytesMut,
    done: &Sender<io::Result<()>>,
) -> Result<usize> {
    if chunk.is_empty() {
        return Ok(0);
    }
    tx.send(WriteCommand::Write {
        file_number: start.file_number,
        offset:      start.position.unsigned_abs(),
        data:        chunk.split().freeze(),
        done:        done.clone(),
    })
    .ok()
    .context(WorkerStoppedSnafu)?;
    Ok(1)
}
