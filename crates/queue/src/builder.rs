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

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    config::{QueueConfig, global_defaults},
    error::{LockTimeoutSnafu, Result},
    file::{FileDriver, StandardFileDriver},
    queue::Queue,
};

/// Backoff step between two lock attempts of [`QueueBuilder::wait_for`].
const LOCK_POLL_STEP: Duration = Duration::from_millis(100);

/// Fluent builder for [`Queue`].
///
/// Starts from a snapshot of [`global_defaults`]; later changes to the global
/// defaults do not affect a builder that already exists.
///
/// # Example
///
/// ```rust,no_run
/// # use diskq::QueueBuilder;
/// let queue = QueueBuilder::new("/var/lib/app/queue")
///     .max_file_size(8 * 1024 * 1024)
///     .paranoid_flushing(false)
///     .build()?;
/// # Ok::<(), diskq::QueueError>(())
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct QueueBuilder {
    config: QueueConfig,
    driver: Option<Arc<dyn FileDriver>>,
}

impl QueueBuilder {
    /// Builder for the queue stored under `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config: QueueConfig {
                base_path: path.into(),
                ..global_defaults()
            },
            driver: None,
        }
    }

    /// Builder seeded from a complete configuration.
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            driver: None,
        }
    }

    pub const fn max_file_size(mut self, bytes: u32) -> Self {
        self.config.max_file_size = bytes;
        self
    }

    /// Strict mode refuses to open a queue whose transaction log holds
    /// malformed bytes.
    pub const fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    pub const fn allow_truncated_entries(mut self, allow: bool) -> Self {
        self.config.allow_truncated_entries = allow;
        self
    }

    pub const fn paranoid_flushing(mut self, enabled: bool) -> Self {
        self.config.paranoid_flushing = enabled;
        self
    }

    pub const fn trim_log_on_dispose(mut self, enabled: bool) -> Self {
        self.config.trim_log_on_dispose = enabled;
        self
    }

    pub const fn suggested_max_log_size(mut self, bytes: u64) -> Self {
        self.config.suggested_max_log_size = bytes;
        self
    }

    pub const fn suggested_read_buffer(mut self, bytes: usize) -> Self {
        self.config.suggested_read_buffer = bytes;
        self
    }

    /// Buffered enqueue volume after which a session starts writing in the
    /// background. Values under 64 KiB are raised to 64 KiB.
    pub const fn suggested_write_buffer(mut self, bytes: usize) -> Self {
        self.config.suggested_write_buffer = bytes;
        self
    }

    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub const fn set_file_permissions(mut self, enabled: bool) -> Self {
        self.config.set_file_permissions = enabled;
        self
    }

    /// Replaces the filesystem access layer. Mostly useful for injecting
    /// faults in tests.
    pub fn file_driver(mut self, driver: Arc<dyn FileDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// The configuration the queue will be opened with.
    pub const fn config(&self) -> &QueueConfig { &self.config }

    /// Opens the queue. Fails with [`QueueError::Locked`] if another thread
    /// or process holds it.
    ///
    /// [`QueueError::Locked`]: crate::QueueError::Locked
    pub fn build(self) -> Result<Queue> {
        let driver = self.driver.unwrap_or_else(|| {
            Arc::new(StandardFileDriver::new().with_permissions(self.config.set_file_permissions))
        });
        Queue::open_engine(self.config, driver)
    }

    /// Like [`build`](Self::build), but keeps retrying while the queue is
    /// locked, waiting a little longer after each attempt, until `max_wait`
    /// has passed.
    pub fn wait_for(self, max_wait: Duration) -> Result<Queue> {
        let started = Instant::now();
        let mut attempt = 1u32;
        loop {
            match self.clone().build() {
                Err(e) if e.is_lock_conflict() && started.elapsed() < max_wait => {
                    let remaining = max_wait.saturating_sub(started.elapsed());
                    debug!(attempt, error = %e, "Queue is locked, waiting");
                    std::thread::sleep((LOCK_POLL_STEP * attempt).min(remaining));
                    attempt += 1;
                }
                Err(e) if e.is_lock_conflict() => {
                    return LockTimeoutSnafu {
                        path:   self.config.base_path,
                        waited: started.elapsed(),
                    }
                    .fail();
                }
                result => return result,
            }
        }
    }
}
