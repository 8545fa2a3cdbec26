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

use bytes::{Buf, BufMut, BytesMut};

/// `meta.state` size: file number (i32) and position (i64), little-endian.
pub const META_SIZE: usize = 12;

/// Persisted write head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaState {
    pub file_number:   i32,
    pub file_position: i64,
}

impl MetaState {
    #[must_use]
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = BytesMut::with_capacity(META_SIZE);
        buf.put_i32_le(self.file_number);
        buf.put_i64_le(self.file_position);

        let mut out = [0u8; META_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes whatever prefix of the record is present. A missing field
    /// keeps its zero default, the same as a queue that was never written.
    #[must_use]
    pub fn decode(mut bytes: &[u8]) -> Self {
        let mut meta = Self::default();
        if bytes.remaining() >= 4 {
            meta.file_number = bytes.get_i32_le();
        }
        if bytes.remaining() >= 8 {
            meta.file_position = bytes.get_i64_le();
        }
        meta
    }
}
