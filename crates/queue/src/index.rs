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

//! In-memory view of the queue.
//!
//! `entries` holds committed items in FIFO order, `checked_out` holds items
//! handed to a session but not yet committed or reinstated, and
//! `items_per_file` counts the live items of both sets per data file.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::{
    entry::Entry,
    operation::{Operation, OperationType},
};

/// Contiguous head run chosen for one read-ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub file_number: i32,
    pub start:       i32,
    /// Total bytes covered by the run.
    pub length:      usize,
    /// Number of head entries covered by the run.
    pub count:       usize,
}

#[derive(Debug, Default)]
pub struct EntryIndex {
    entries:        VecDeque<Entry>,
    checked_out:    HashSet<Entry>,
    items_per_file: HashMap<i32, i32>,
}

impl EntryIndex {
    pub fn new() -> Self { Self::default() }

    /// Committed plus checked-out items.
    pub fn live_count(&self) -> usize { self.entries.len() + self.checked_out.len() }

    /// Items still visible to `dequeue`.
    pub fn visible_len(&self) -> usize { self.entries.len() }

    pub fn checked_out_len(&self) -> usize { self.checked_out.len() }

    /// Whether any live item still points into `file_number`.
    pub fn references_file(&self, file_number: i32) -> bool {
        self.items_per_file.contains_key(&file_number)
    }

    /// Applies a batch of operations and returns the data files that no
    /// longer hold a live item, in ascending order.
    pub fn apply(&mut self, operations: &[Operation]) -> Vec<i32> {
        for op in operations {
            let entry = Entry::from(op);
            match op.kind {
                OperationType::Enqueue => {
                    *self.items_per_file.entry(op.file_number).or_insert(0) += 1;
                    self.entries.push_back(entry);
                }
                OperationType::Dequeue => {
                    // Replaying a committed dequeue finds the entry still queued.
                    if !self.checked_out.remove(&entry) {
                        if let Some(pos) = self.entries.iter().position(|e| *e == entry) {
                            self.entries.remove(pos);
                        }
                    }
                    *self.items_per_file.entry(op.file_number).or_insert(0) -= 1;
                }
                OperationType::Reinstate => {
                    self.checked_out.remove(&entry);
                    self.entries.push_front(entry);
                }
            }
        }

        let mut drained: Vec<i32> = self
            .items_per_file
            .iter()
            .filter(|(_, count)| **count <= 0)
            .map(|(file_number, _)| *file_number)
            .collect();
        for file_number in &drained {
            self.items_per_file.remove(file_number);
        }
        drained.sort_unstable();
        drained
    }

    /// Furthest byte any live item reaches, as `(file_number, end)`.
    pub fn max_extent(&self) -> Option<(i32, i64)> {
        self.entries
            .iter()
            .chain(self.checked_out.iter())
            .map(|e| (e.file_number, i64::from(e.start) + i64::from(e.length)))
            .max()
    }

    /// Whether the head entry still needs its bytes loaded.
    pub fn head_needs_data(&self) -> bool {
        self.entries.front().is_some_and(|e| e.data.is_none())
    }

    /// Plans a read-ahead starting at the head: the head entry always, then
    /// following entries while they are contiguous in the same file and the
    /// run stays within `limit` bytes.
    pub fn read_span(&self, limit: usize) -> Option<ReadSpan> {
        let first = self.entries.front()?;
        let mut last = first;
        let mut length = entry_len(first);
        let mut count = 1;

        for entry in self.entries.iter().skip(1) {
            if !last.is_followed_by(entry) || length + entry_len(entry) > limit {
                break;
            }
            length += entry_len(entry);
            count += 1;
            last = entry;
        }

        Some(ReadSpan {
            file_number: first.file_number,
            start: first.start,
            length,
            count,
        })
    }

    /// Slices a read-ahead buffer back into the first `span.count` entries.
    pub fn fill(&mut self, span: ReadSpan, buffer: &Bytes) {
        let mut offset = 0;
        for entry in self.entries.iter_mut().take(span.count) {
            let len = entry_len(entry);
            entry.data = Some(buffer.slice(offset..offset + len));
            offset += len;
        }
    }

    /// Moves the head entry into the checked-out set and returns it with
    /// whatever data it carried.
    pub fn check_out_head(&mut self) -> Option<Entry> {
        let head = self.entries.pop_front()?;
        self.checked_out.insert(head.position_only());
        Some(head)
    }

    /// Checked-out entries first, then queue order. Checked-out entries are
    /// ordered by position so the output is deterministic.
    pub fn trim_operations(&self) -> Vec<Operation> {
        let mut checked_out: Vec<&Entry> = self.checked_out.iter().collect();
        checked_out.sort_unstable_by_key(|e| (e.file_number, e.start));

        checked_out
            .into_iter()
            .chain(self.entries.iter())
            .map(|e| Operation::enqueue(e.file_number, e.start, e.length))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.checked_out.clear();
        self.items_per_file.clear();
    }
}

#[allow(clippy::cast_sign_loss)]
fn entry_len(entry: &Entry) -> usize { entry.length.max(0) as usize }
