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

//! Queue configuration and the process-wide default template.
//!
//! A [`QueueConfig`] is captured once when a queue is opened; the engine never
//! looks at [`global_defaults`] afterwards. The global template only seeds new
//! [`QueueBuilder`](crate::QueueBuilder)s.

use std::{path::PathBuf, sync::LazyLock, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// 32 MiB, the default data file and transaction log size threshold.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 32 * 1024 * 1024;

/// Sessions never issue speculative writes smaller than this.
pub const MIN_ASYNC_WRITE_SIZE: usize = 64 * 1024;

static GLOBAL_DEFAULTS: LazyLock<RwLock<QueueConfig>> =
    LazyLock::new(|| RwLock::new(QueueConfig::default()));

/// Configuration for a single open queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue directory. Created on open if missing.
    #[default(PathBuf::from("./queue_data"))]
    pub base_path: PathBuf,

    /// A data file is rolled over once its write position reaches this size.
    /// Must fit the 32-bit offsets recorded in the transaction log.
    #[default(DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u32,

    /// Strict mode fails `open` on malformed transaction log bytes. Lenient
    /// mode treats them as the end of the log.
    #[default = true]
    pub strict: bool,

    /// When set, an item whose bytes cannot be read is skipped and the
    /// dequeue reports no item instead of failing.
    #[default = false]
    pub allow_truncated_entries: bool,

    /// Rewrite the trimmed transaction log after every commit.
    #[default = true]
    pub paranoid_flushing: bool,

    /// Rewrite the trimmed transaction log when the queue is closed.
    #[default = true]
    pub trim_log_on_dispose: bool,

    /// Log size above which a commit considers trimming.
    #[default(u64::from(DEFAULT_MAX_FILE_SIZE))]
    pub suggested_max_log_size: u64,

    /// Upper bound for a single coalesced read-ahead.
    #[default(1024 * 1024)]
    pub suggested_read_buffer: usize,

    /// Buffered enqueue volume that triggers a speculative write.
    #[default(1024 * 1024)]
    pub suggested_write_buffer: usize,

    /// How long a flush waits for a single data write to finish.
    #[default(Duration::from_secs(30))]
    pub io_timeout: Duration,

    /// Best-effort read/write-for-all permissions on created files.
    #[default = false]
    pub set_file_permissions: bool,
}

impl QueueConfig {
    /// Default configuration rooted at `base_path`.
    pub fn with_base_path<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    /// Effective speculative write threshold.
    #[must_use]
    pub fn write_buffer_size(&self) -> usize {
        self.suggested_write_buffer.max(MIN_ASYNC_WRITE_SIZE)
    }
}

/// Snapshot of the process-wide default configuration.
#[must_use]
pub fn global_defaults() -> QueueConfig { GLOBAL_DEFAULTS.read().clone() }

/// Replace the process-wide default configuration.
///
/// Only affects builders created afterwards; open queues keep the
/// configuration they were opened with.
pub fn set_global_defaults(config: QueueConfig) { *GLOBAL_DEFAULTS.write() = config; }
