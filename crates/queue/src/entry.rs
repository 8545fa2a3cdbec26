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

use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::operation::Operation;

/// A queued item: a byte range inside one data file.
///
/// Identity is `(file_number, start, length)`. `data` is filled by read-ahead
/// on its way out of the queue and never takes part in equality.
#[derive(Debug, Clone)]
pub struct Entry {
    pub file_number: i32,
    pub start:       i32,
    pub length:      i32,
    pub data:        Option<Bytes>,
}

impl Entry {
    #[must_use]
    pub const fn new(file_number: i32, start: i32, length: i32) -> Self {
        Self {
            file_number,
            start,
            length,
            data: None,
        }
    }

    /// Same position, no payload.
    #[must_use]
    pub const fn position_only(&self) -> Self {
        Self::new(self.file_number, self.start, self.length)
    }

    /// Whether `next` starts exactly where this entry ends in the same file.
    #[must_use]
    pub fn is_followed_by(&self, next: &Self) -> bool {
        self.file_number == next.file_number
            && i64::from(self.start) + i64::from(self.length) == i64::from(next.start)
    }
}

impl From<&Operation> for Entry {
    fn from(op: &Operation) -> Self { Self::new(op.file_number, op.start, op.length) }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.file_number == other.file_number
            && self.start == other.start
            && self.length == other.length
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file_number.hash(state);
        self.start.hash(state);
        self.length.hash(state);
    }
}
