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

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

use crate::lock::LockHolder;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(context(false), display("IO error: {source}"))]
    Io { source: io::Error },

    /// Another thread or process holds the queue directory lock.
    #[snafu(display("Queue at {} is locked by {holder}", path.display()))]
    Locked {
        path:   PathBuf,
        holder: LockHolder,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Gave up waiting for the queue directory lock.
    #[snafu(display("Could not acquire the lock on {} within {waited:?}", path.display()))]
    LockTimeout {
        path:   PathBuf,
        waited: Duration,
    },

    /// Malformed bytes in the transaction log while running in strict mode.
    #[snafu(display("Transaction log corrupted at transaction #{transaction}: {reason}"))]
    LogCorrupted {
        transaction: u32,
        reason:      String,
        #[snafu(implicit)]
        loc:         snafu::Location,
    },

    /// Reading a queued item from its data file failed after retries.
    #[snafu(display(
        "Failed to read {length} bytes at {start} from data file {file_number}: {source}"
    ))]
    DataRead {
        file_number: i32,
        start:       i32,
        length:      usize,
        source:      io::Error,
    },

    /// One or more data writes issued by a session failed.
    #[snafu(display(
        "Error during pending writes:{}",
        failures.iter().map(|f| format!("\n - {f}")).collect::<String>()
    ))]
    PendingWrite { failures: Vec<String> },

    /// A data write did not complete within the configured I/O timeout.
    #[snafu(display("Data write did not complete within {waited:?}"))]
    WriteTimeout { waited: Duration },

    /// The background I/O worker is no longer running.
    #[snafu(display("IO worker has stopped"))]
    WorkerStopped,

    /// The queue has already been closed.
    #[snafu(display("Queue has been closed"))]
    Disposed,

    /// A single item does not fit the on-disk entry format.
    #[snafu(display("Item of {length} bytes exceeds the maximum entry size"))]
    PayloadTooLarge { length: usize },

    /// Rejected configuration value.
    #[snafu(display("Invalid queue configuration: {message}"))]
    InvalidConfig { message: String },

    /// Typed queue encode or decode failure.
    #[snafu(display("Serialization failed: {message}"))]
    Serialization { message: String },

    /// Broken internal invariant. Never retried.
    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },
}

impl QueueError {
    /// Whether this error reports a lock held by another thread or process.
    #[must_use]
    pub const fn is_lock_conflict(&self) -> bool { matches!(self, Self::Locked { .. }) }

    /// Whether this error reports strict-mode transaction log corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool { matches!(self, Self::LogCorrupted { .. }) }
}

impl From<QueueError> for io::Error {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Io { source } => source,
            other => Self::other(other),
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
