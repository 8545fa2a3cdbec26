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

//! Transaction log framing.
//!
//! Layout of one transaction (little-endian):
//!
//! ```text
//! +----------------+-----------+-------------------------+--------------+
//! | start marker   | op count  | op * count              | end marker   |
//! | 16 bytes       | i32       | 17 bytes each           | 16 bytes     |
//! +----------------+-----------+-------------------------+--------------+
//!
//! op = separator u32 (0x42FEBCA1) | type u8 | file_number i32 | start i32 | length i32
//! ```
//!
//! The markers are GUIDs in their mixed-endian binary form. Existing queues
//! depend on these exact bytes.

use bytes::{BufMut, Bytes, BytesMut};
use snafu::OptionExt;

use crate::{
    error::{InternalSnafu, Result},
    operation::Operation,
};

/// `b75bfb12-93bb-42b6-acb1-a897239ea3a5`
pub const START_MARKER: [u8; 16] = [
    0x12, 0xfb, 0x5b, 0xb7, 0xbb, 0x93, 0xb6, 0x42, 0xac, 0xb1, 0xa8, 0x97, 0x23, 0x9e, 0xa3, 0xa5,
];

/// `866c9705-4456-4e9d-b452-3146b3bfa4ce`
pub const END_MARKER: [u8; 16] = [
    0x05, 0x97, 0x6c, 0x86, 0x56, 0x44, 0x9d, 0x4e, 0xb4, 0x52, 0x31, 0x46, 0xb3, 0xbf, 0xa4, 0xce,
];

pub const MARKER_SIZE: usize = 16;

/// Precedes every operation record.
pub const OPERATION_SEPARATOR: u32 = 0x42FE_BCA1;

/// Separator, type, file number, start, length.
pub const OPERATION_SIZE: usize = 4 + 1 + 4 + 4 + 4;

/// Markers plus the operation count.
pub const FRAME_OVERHEAD: usize = MARKER_SIZE + 4 + MARKER_SIZE;

/// Encoded size of a transaction holding `operations` records.
#[must_use]
pub const fn transaction_size(operations: usize) -> u64 {
    (FRAME_OVERHEAD + operations * OPERATION_SIZE) as u64
}

/// Frames `operations` as a single transaction.
pub fn encode_transaction(operations: &[Operation]) -> Result<Bytes> {
    let count = i32::try_from(operations.len()).ok().context(InternalSnafu {
        message: format!("{} operations do not fit one transaction", operations.len()),
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + operations.len() * OPERATION_SIZE);
    buf.put_slice(&START_MARKER);
    buf.put_i32_le(count);
    for op in operations {
        encode_operation(&mut buf, op);
    }
    buf.put_slice(&END_MARKER);

    Ok(buf.freeze())
}

fn encode_operation(buf: &mut BytesMut, op: &Operation) {
    buf.put_u32_le(OPERATION_SEPARATOR);
    buf.put_u8(op.kind.into());
    buf.put_i32_le(op.file_number);
    buf.put_i32_le(op.start);
    buf.put_i32_le(op.length);
}
