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

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::entry::Entry;

/// Kind of change recorded in the transaction log.
///
/// The discriminants are written to disk and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OperationType {
    /// New item appended to the tail of the queue.
    Enqueue   = 1,
    /// Item removed from the head of the queue.
    Dequeue   = 2,
    /// Dequeue reverted; the item goes back to the head.
    Reinstate = 3,
}

/// A change to one byte range of one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind:        OperationType,
    pub file_number: i32,
    pub start:       i32,
    pub length:      i32,
}

impl Operation {
    #[must_use]
    pub const fn new(kind: OperationType, file_number: i32, start: i32, length: i32) -> Self {
        Self {
            kind,
            file_number,
            start,
            length,
        }
    }

    #[must_use]
    pub const fn enqueue(file_number: i32, start: i32, length: i32) -> Self {
        Self::new(OperationType::Enqueue, file_number, start, length)
    }

    #[must_use]
    pub const fn dequeue(entry: &Entry) -> Self {
        Self::new(
            OperationType::Dequeue,
            entry.file_number,
            entry.start,
            entry.length,
        )
    }

    /// The reinstate that reverts this operation, if it is a dequeue.
    #[must_use]
    pub const fn reverted(&self) -> Option<Self> {
        match self.kind {
            OperationType::Dequeue => Some(Self::new(
                OperationType::Reinstate,
                self.file_number,
                self.start,
                self.length,
            )),
            OperationType::Enqueue | OperationType::Reinstate => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(OperationType::Enqueue, 1 ; "enqueue")]
    #[test_case(OperationType::Dequeue, 2 ; "dequeue")]
    #[test_case(OperationType::Reinstate, 3 ; "reinstate")]
    fn test_on_disk_tags(kind: OperationType, tag: u8) {
        assert_eq!(u8::from(kind), tag);
        assert_eq!(OperationType::try_from(tag).unwrap(), kind);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(OperationType::try_from(0u8).is_err());
        assert!(OperationType::try_from(4u8).is_err());
    }

    #[test]
    fn test_only_dequeues_revert() {
        let dequeue = Operation::new(OperationType::Dequeue, 1, 10, 5);
        assert_eq!(
            dequeue.reverted(),
            Some(Operation::new(OperationType::Reinstate, 1, 10, 5))
        );
        assert_eq!(Operation::enqueue(1, 10, 5).reverted(), None);
    }
}
