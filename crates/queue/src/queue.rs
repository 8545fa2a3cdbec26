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
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing::warn;

use crate::{
    builder::QueueBuilder,
    config::QueueConfig,
    engine::Engine,
    error::Result,
    file::FileDriver,
    session::Session,
};

/// A persistent FIFO queue stored in one directory.
///
/// Only one `Queue` per directory can be open at a time, across threads and
/// processes. Work happens in [`Session`]s; a queue can hand out any number
/// of them concurrently.
///
/// Call [`close`](Self::close) when done. Dropping an open queue still
/// releases its lock, but skips the closing log trim and logs a warning.
///
/// # Example
///
/// ```rust,no_run
/// # use diskq::Queue;
/// let queue = Queue::open("/var/lib/app/queue")?;
///
/// let mut producer = queue.open_session()?;
/// producer.enqueue(&b"job-1"[..])?;
/// producer.flush()?;
///
/// let mut consumer = queue.open_session()?;
/// if let Some(job) = consumer.dequeue()? {
///     println!("got {} bytes", job.len());
///     consumer.flush()?;
/// }
///
/// queue.close()?;
/// # Ok::<(), diskq::QueueError>(())
/// ```
#[derive(Debug)]
pub struct Queue {
    engine: Arc<Engine>,
}

impl Queue {
    /// Opens the queue at `path` with the process-wide default settings.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> { QueueBuilder::new(path).build() }

    /// Opens the queue at `path` with a specific data file size and
    /// corruption policy.
    pub fn open_with<P: Into<PathBuf>>(path: P, max_file_size: u32, strict: bool) -> Result<Self> {
        QueueBuilder::new(path)
            .max_file_size(max_file_size)
            .strict(strict)
            .build()
    }

    /// Opens a queue from a complete configuration.
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        QueueBuilder::from_config(config).build()
    }

    /// Opens the queue at `path`, waiting up to `max_wait` for another
    /// holder to release it.
    pub fn wait_for<P: Into<PathBuf>>(path: P, max_wait: Duration) -> Result<Self> {
        QueueBuilder::new(path).wait_for(max_wait)
    }

    pub(crate) fn open_engine(config: QueueConfig, driver: Arc<dyn FileDriver>) -> Result<Self> {
        Ok(Self {
            engine: Engine::open(config, driver)?,
        })
    }

    /// Starts a new unit of work.
    pub fn open_session(&self) -> Result<Session> {
        let session = Session::new(Arc::clone(&self.engine));
        self.engine.ensure_usable(session.epoch())?;
        Ok(session)
    }

    /// Items in the queue, including those dequeued by sessions that have
    /// not flushed yet.
    pub fn estimated_count(&self) -> usize { self.engine.estimated_count() }

    /// Data file new items are written to.
    pub fn current_file_number(&self) -> i32 { self.engine.current_file_number() }

    pub fn max_file_size(&self) -> u32 { self.engine.config().max_file_size }

    pub fn config(&self) -> &QueueConfig { self.engine.config() }

    pub fn path(&self) -> &Path { self.engine.base_path() }

    /// Rewrites the transaction log down to the current queue contents.
    pub fn trim_log(&self) -> Result<()> { self.engine.trim_log() }

    /// Deletes every file of the queue, queued items included.
    ///
    /// With `reset` the queue stays open and empty. Without it the queue is
    /// closed. Sessions opened before the delete fail with
    /// [`QueueError::Disposed`](crate::QueueError::Disposed) from then on.
    pub fn hard_delete(&self, reset: bool) -> Result<()> { self.engine.hard_delete(reset) }

    /// Closes the queue and releases its lock, trimming the transaction log
    /// first when `trim_log_on_dispose` is set.
    pub fn close(self) -> Result<()> {
        self.engine.close(self.engine.config().trim_log_on_dispose)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.engine.is_disposed() {
            return;
        }
        warn!(path = ?self.engine.base_path(), "Queue dropped without close, releasing lock");
        if let Err(e) = self.engine.close(false) {
            warn!(error = %e, "Failed to close queue on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::QueueError;

    #[test]
    fn test_flush_makes_items_visible() {
        let dir = TempDir::new().unwrap();
        let queue = Queue::open(dir.path()).unwrap();

        let mut producer = queue.open_session().unwrap();
        producer.enqueue(&b"hello"[..]).unwrap();

        let mut consumer = queue.open_session().unwrap();
        assert_eq!(consumer.dequeue().unwrap(), None);

        producer.flush().unwrap();
        assert_eq!(consumer.dequeue().unwrap().unwrap(), &b"hello"[..]);
        consumer.flush().unwrap();
        assert_eq!(queue.estimated_count(), 0);

        queue.close().unwrap();
    }

    #[test]
    fn test_second_open_is_lock_conflict() {
        let dir = TempDir::new().unwrap();
        let queue = Queue::open(dir.path()).unwrap();

        let err = Queue::open(dir.path()).unwrap_err();
        assert!(err.is_lock_conflict(), "{err}");
        drop(queue);

        // Dropping releases the lock even without close.
        Queue::open(dir.path()).unwrap().close().unwrap();
    }

    #[test]
    fn test_hard_delete_without_reset_closes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("q");
        let queue = Queue::open(&base).unwrap();
        let mut session = queue.open_session().unwrap();
        session.enqueue(&b"x"[..]).unwrap();
        session.flush().unwrap();

        queue.hard_delete(false).unwrap();
        assert!(!base.exists());
        assert!(matches!(
            queue.open_session().unwrap_err(),
            QueueError::Disposed
        ));
        assert!(matches!(session.flush().unwrap_err(), QueueError::Disposed));
    }
}
