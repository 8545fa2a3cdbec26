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

//! Queue engine: transaction log, entry index and data files of one open
//! queue directory.
//!
//! ## Locks
//!
//! 1. the directory lock file, held for the lifetime of the engine
//! 2. the appender's writer lock, guarding the write head and rollover
//! 3. `txlog`, held across log append, index apply, meta write and trim
//! 4. `index`, nested inside `txlog` on commit and replay, also taken on its
//!    own by dequeue and reinstate
//!
//! The writer lock is a leaf: it is never held while `txlog` or `index` is
//! acquired. Commit and replay read or move the write head under `txlog`,
//! taking the writer lock briefly and releasing it before anything else.
//!
//! ## Commit
//!
//! A commit appends one transaction to the log and syncs it, applies it to
//! the index, deletes drained data files, rewrites `meta.state`, and trims
//! the log when it has grown or paranoid flushing is on. Once the index has
//! been updated the transaction counts as committed, even if a later step
//! fails.

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    appender::{Appender, WriteHead},
    config::QueueConfig,
    entry::Entry,
    error::{DataReadSnafu, DisposedSnafu, InternalSnafu, InvalidConfigSnafu, Result},
    file::{FileDriver, is_pending_delete},
    index::{EntryIndex, ReadSpan},
    io_worker::IOWorker,
    lock::LockFile,
    meta::MetaState,
    operation::Operation,
    path::{data_file_number, data_file_path, lock_path, meta_path, transaction_log_path},
    recovery,
    txlog::{encode_transaction, transaction_size},
};

/// Attempts made by a read-ahead before it gives up.
const READ_RETRIES: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct LogState {
    /// A failed append may have left a partial transaction at the end of the
    /// log; rewrite it before appending again.
    dirty: bool,
}

/// Shared state of one open queue.
#[derive(Debug)]
pub struct Engine {
    config:    QueueConfig,
    base_path: PathBuf,
    driver:    Arc<dyn FileDriver>,
    appender:  Appender,
    txlog:     Mutex<LogState>,
    index:     Mutex<EntryIndex>,
    lock:      Mutex<Option<LockFile>>,
    worker:    Mutex<Option<JoinHandle<()>>>,
    disposed:  AtomicBool,
    /// Bumped by every hard delete. Sessions opened before it are stale.
    epoch:     AtomicU64,
}

impl Engine {
    /// Opens the queue directory described by `config`: takes the lock,
    /// loads the write head, replays the transaction log and starts the I/O
    /// worker.
    pub fn open(config: QueueConfig, driver: Arc<dyn FileDriver>) -> Result<Arc<Self>> {
        ensure!(
            config.max_file_size > 0 && i32::try_from(config.max_file_size).is_ok(),
            InvalidConfigSnafu {
                message: format!(
                    "max_file_size must be between 1 and {}, got {}",
                    i32::MAX,
                    config.max_file_size
                ),
            }
        );

        let base_path = std::path::absolute(&config.base_path)?;
        driver.create_dir_all(&base_path)?;
        let lock = LockFile::acquire(lock_path(&base_path))?;

        let meta = driver
            .atomic_read(&meta_path(&base_path))?
            .map(|bytes| MetaState::decode(&bytes))
            .unwrap_or_default();

        let (tx, rx) = unbounded();
        let mut worker = IOWorker::new(rx, Arc::clone(&driver), base_path.clone());
        let handle = thread::Builder::new()
            .name("queue-io-worker".into())
            .spawn(move || worker.run())?;

        let engine = Self {
            appender: Appender::new(
                WriteHead {
                    file_number: meta.file_number,
                    position:    meta.file_position,
                },
                tx,
                config.max_file_size,
            ),
            config,
            base_path,
            driver,
            txlog: Mutex::new(LogState::default()),
            index: Mutex::new(EntryIndex::new()),
            lock: Mutex::new(Some(lock)),
            worker: Mutex::new(Some(handle)),
            disposed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        };

        // Dropping the engine on error stops the worker and releases the lock.
        engine.recover(meta)?;
        engine.sweep_orphans()?;

        let head = engine.appender.head();
        info!(
            path = ?engine.base_path,
            items = engine.estimated_count(),
            file_number = head.file_number,
            position = head.position,
            "Queue initialized"
        );
        Ok(Arc::new(engine))
    }

    pub const fn config(&self) -> &QueueConfig { &self.config }

    pub fn base_path(&self) -> &Path { &self.base_path }

    pub const fn appender(&self) -> &Appender { &self.appender }

    pub fn estimated_count(&self) -> usize { self.index.lock().live_count() }

    pub fn current_file_number(&self) -> i32 { self.appender.head().file_number }

    pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::Acquire) }

    pub fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }

    /// Fails if the engine was closed or wiped since `epoch`.
    pub fn ensure_usable(&self, epoch: u64) -> Result<()> {
        ensure!(!self.is_disposed() && self.epoch() == epoch, DisposedSnafu);
        Ok(())
    }

    fn recover(&self, meta: MetaState) -> Result<()> {
        let mut log = self.txlog.lock();

        let summary = match self
            .driver
            .atomic_read(&transaction_log_path(&self.base_path))?
        {
            Some(bytes) => {
                let mut index = self.index.lock();
                recovery::replay(&bytes, self.config.strict, |ops| {
                    // Drained files are swept once replay is done.
                    index.apply(ops);
                })?
            }
            None => recovery::ReplaySummary::default(),
        };

        // A crash between the log append and the meta write leaves the head
        // behind committed data. Never write over it.
        let extent = self.index.lock().max_extent();
        let head = self.appender.head();
        if let Some((file_number, end)) = extent
            && (file_number > head.file_number
                || (file_number == head.file_number && end > head.position))
        {
            warn!(
                meta_file = meta.file_number,
                meta_position = meta.file_position,
                file_number,
                position = end,
                "Write head was behind the transaction log, moving it forward"
            );
            self.appender.reset(WriteHead {
                file_number,
                position: end,
            });
        }

        if summary.needs_trim {
            self.flush_trimmed_log(&mut log)?;
        }
        Ok(())
    }

    /// Deletes data files no live item points into, and files left over by
    /// deletes that were interrupted.
    fn sweep_orphans(&self) -> Result<()> {
        let head = self.appender.head();
        let index = self.index.lock();
        for path in self.driver.list_dir(&self.base_path)? {
            let orphan = match data_file_number(&path) {
                Some(n) => n != head.file_number && !index.references_file(n),
                None => is_pending_delete(&path),
            };
            if orphan {
                debug!(path = ?path, "Removing orphaned data file");
                self.driver.prepare_delete(&path)?;
            }
        }
        drop(index);
        self.finalize_deletes();
        Ok(())
    }

    /// Takes the head of the queue for a session.
    ///
    /// Returns `None` when the queue is empty. With `allow_truncated_entries`
    /// an unreadable head is still checked out, with no data, so the session
    /// can commit it away.
    pub fn dequeue(&self, epoch: u64) -> Result<Option<Entry>> {
        let mut index = self.index.lock();
        self.ensure_usable(epoch)?;

        if index.head_needs_data() {
            let span = index.read_span(self.config.suggested_read_buffer).context(InternalSnafu {
                message: "queue head vanished during read-ahead",
            })?;

            match self.read_span(span) {
                Ok(buffer) => index.fill(span, &buffer),
                Err(e) if self.config.allow_truncated_entries => {
                    warn!(
                        file_number = span.file_number,
                        start = span.start,
                        length = span.length,
                        error = %e,
                        "Skipping unreadable entry"
                    );
                }
                Err(e) => {
                    return Err(e).context(DataReadSnafu {
                        file_number: span.file_number,
                        start:       span.start,
                        length:      span.length,
                    });
                }
            }
        }

        Ok(index.check_out_head())
    }

    fn read_span(&self, span: ReadSpan) -> io::Result<Bytes> {
        if span.length == 0 {
            return Ok(Bytes::new());
        }
        let path = data_file_path(&self.base_path, span.file_number);
        let offset = u64::try_from(span.start).map_err(io::Error::other)?;

        let mut attempt = 1;
        loop {
            let result = self.driver.open_read(&path).and_then(|mut stream| {
                stream.seek(SeekFrom::Start(offset))?;
                let mut buffer = vec![0u8; span.length];
                stream.read_exact(&mut buffer)?;
                Ok(Bytes::from(buffer))
            });
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt >= READ_RETRIES => return Err(e),
                Err(e) => {
                    debug!(path = ?path, attempt, error = %e, "Retrying data read");
                    thread::sleep(READ_BACKOFF * attempt);
                    attempt += 1;
                }
            }
        }
    }

    /// Returns the dequeues among `operations` to the head of the queue, most
    /// recent first, so the original order is restored. Nothing is logged.
    pub fn reinstate(&self, operations: &[Operation], epoch: u64) {
        if self.epoch() != epoch {
            debug!("Dropping reinstate from before a hard delete");
            return;
        }
        let reinstates: Vec<Operation> = operations
            .iter()
            .rev()
            .filter_map(Operation::reverted)
            .collect();
        if reinstates.is_empty() {
            return;
        }
        self.index.lock().apply(&reinstates);
        debug!(count = reinstates.len(), "Reinstated uncommitted dequeues");
    }

    /// Commits `operations` as one transaction.
    ///
    /// `operations` is drained once the transaction is applied, so a caller
    /// retrying after an error never applies it twice.
    pub fn commit(&self, operations: &mut Vec<Operation>, epoch: u64) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let encoded = encode_transaction(operations)?;

        let mut log = self.txlog.lock();
        self.ensure_usable(epoch)?;
        if log.dirty {
            self.flush_trimmed_log(&mut log)?;
        }

        let log_size = match self.append_to_log(&encoded) {
            Ok(size) => size,
            Err(e) => {
                log.dirty = true;
                return Err(e.into());
            }
        };

        let committed = std::mem::take(operations);
        let (drained, live) = {
            let mut index = self.index.lock();
            let drained = index.apply(&committed);
            debug!(
                operations = committed.len(),
                queued = index.visible_len(),
                checked_out = index.checked_out_len(),
                log_size,
                "Committed transaction"
            );
            (drained, index.live_count())
        };
        self.appender.unreserve(&committed);

        self.delete_drained(&drained);
        self.write_meta()?;

        if self.config.paranoid_flushing
            || (log_size > self.config.suggested_max_log_size
                && log_size > 2 * transaction_size(live))
        {
            self.flush_trimmed_log(&mut log)?;
        }
        Ok(())
    }

    fn append_to_log(&self, encoded: &[u8]) -> io::Result<u64> {
        let path = transaction_log_path(&self.base_path);
        let mut stream = self.driver.open_append(&path)?;
        stream.write_all(encoded)?;
        stream.sync()?;
        stream.size()
    }

    fn delete_drained(&self, drained: &[i32]) {
        if drained.is_empty() {
            return;
        }
        let current = self.appender.head().file_number;
        for &file_number in drained {
            if file_number == current || self.appender.is_reserved(file_number) {
                continue;
            }
            let path = data_file_path(&self.base_path, file_number);
            match self.driver.prepare_delete(&path) {
                Ok(()) => debug!(file_number, "Data file drained"),
                Err(e) => warn!(file_number, error = %e, "Failed to delete drained data file"),
            }
        }
        self.finalize_deletes();
    }

    fn finalize_deletes(&self) {
        if let Err(e) = self.driver.finalize_deletes() {
            warn!(error = %e, "Failed to finalize data file deletes");
        }
    }

    fn write_meta(&self) -> Result<()> {
        let head = self.appender.head();
        let meta = MetaState {
            file_number:   head.file_number,
            file_position: head.position,
        };
        self.driver
            .atomic_write(&meta_path(&self.base_path), &meta.encode())?;
        Ok(())
    }

    /// Rewrites the transaction log as a single transaction holding the
    /// current queue state.
    pub fn trim_log(&self) -> Result<()> {
        ensure!(!self.is_disposed(), DisposedSnafu);
        let mut log = self.txlog.lock();
        self.flush_trimmed_log(&mut log)
    }

    fn flush_trimmed_log(&self, log: &mut LogState) -> Result<()> {
        let operations = self.index.lock().trim_operations();
        let encoded = encode_transaction(&operations)?;
        if let Err(e) = self
            .driver
            .atomic_write(&transaction_log_path(&self.base_path), &encoded)
        {
            log.dirty = true;
            return Err(e.into());
        }
        log.dirty = false;
        debug!(
            entries = operations.len(),
            size = encoded.len(),
            "Transaction log trimmed"
        );
        Ok(())
    }

    /// Removes every file of the queue. With `reset` the engine continues on
    /// an empty directory; otherwise it is closed.
    pub fn hard_delete(&self, reset: bool) -> Result<()> {
        ensure!(!self.is_disposed(), DisposedSnafu);
        let mut log = self.txlog.lock();

        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.appender.release_files(self.config.io_timeout)?;
        self.index.lock().clear();
        self.appender.reset(WriteHead::default());
        log.dirty = false;

        if let Some(lock) = self.lock.lock().take() {
            lock.release()?;
        }
        self.driver.delete_recursive(&self.base_path)?;
        info!(path = ?self.base_path, reset, "Queue hard deleted");

        if reset {
            self.driver.create_dir_all(&self.base_path)?;
            *self.lock.lock() = Some(LockFile::acquire(lock_path(&self.base_path))?);
        } else {
            drop(log);
            self.disposed.store(true, Ordering::Release);
            self.shutdown();
        }
        Ok(())
    }

    /// Closes the queue, trimming the log first if configured to.
    pub fn close(&self, trim: bool) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let trimmed = if trim {
            let mut log = self.txlog.lock();
            self.flush_trimmed_log(&mut log)
        } else {
            Ok(())
        };
        self.shutdown();
        info!(path = ?self.base_path, "Queue closed");
        trimmed
    }

    /// Stops the I/O worker and releases the directory lock.
    fn shutdown(&self) {
        self.appender.close();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            warn!("IO worker thread panicked");
        }
        if let Some(lock) = self.lock.lock().take()
            && let Err(e) = lock.release()
        {
            warn!(error = %e, "Failed to release queue lock");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
        self.shutdown();
    }
}
