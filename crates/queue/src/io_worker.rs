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

//! Background I/O worker that owns the data file being written.
//!
//! ## Architecture
//!
//! The [`Appender`](crate::appender::Appender) decides where every payload
//! goes and sends [`WriteCommand`]s over a crossbeam channel. The IOWorker
//! applies them in channel order on its own thread, so sessions can keep
//! buffering while their earlier bytes are on their way to disk.
//!
//! ```text
//! ┌──────────────┐     crossbeam      ┌──────────────┐    FileDriver   ┌──────────────┐
//! │   Appender   │ ──── channel ────► │   IOWorker   │ ──────────────► │  data.N      │
//! │  (session)   │ ◄─── done ──────── │  (bg thread) │                 │              │
//! └──────────────┘                    └──────────────┘                 └──────────────┘
//! ```
//!
//! Files that were rolled away from, or whose handle saw a failed write, are
//! kept open until a [`WriteCommand::Sync`] forces them to disk. A handle
//! whose sync fails is kept for the next one.

use std::{
    io::{self, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    file::{FileDriver, FileStream},
    path::data_file_path,
};

/// Completion signal for a write or sync.
pub type Done = Sender<io::Result<()>>;

/// Work items processed by the [`IOWorker`].
#[derive(Debug)]
pub enum WriteCommand {
    /// Write `data` at `offset` in data file `file_number`.
    Write {
        file_number: i32,
        offset:      u64,
        data:        Bytes,
        done:        Done,
    },
    /// Switch to a new data file, pre-extended to `preallocate` bytes.
    Roll {
        file_number: i32,
        preallocate: u64,
    },
    /// Force everything written so far to disk.
    Sync { done: Done },
    /// Close every open data file.
    Release { done: Sender<()> },
}

struct OpenFile {
    file_number: i32,
    stream:      Box<dyn FileStream>,
}

/// Applies [`WriteCommand`]s to data files.
pub struct IOWorker {
    rx:        Receiver<WriteCommand>,
    driver:    Arc<dyn FileDriver>,
    base_path: PathBuf,
    current:   Option<OpenFile>,
    /// Rolled away from, not synced yet.
    unsynced:  Vec<OpenFile>,
}

impl IOWorker {
    pub fn new(rx: Receiver<WriteCommand>, driver: Arc<dyn FileDriver>, base_path: PathBuf) -> Self {
        Self {
            rx,
            driver,
            base_path,
            current: None,
            unsynced: Vec::new(),
        }
    }

    /// Processes commands until every sender is gone, then syncs what is
    /// still open.
    pub fn run(&mut self) {
        info!(path = ?self.base_path, "IOWorker starting");

        while let Ok(command) = self.rx.recv() {
            self.handle(command);
        }

        if let Err(e) = self.sync_all() {
            error!(error = %e, "Failed to sync data files on shutdown");
        }
        self.current = None;

        info!("IOWorker stopped");
    }

    fn handle(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Write {
                file_number,
                offset,
                data,
                done,
            } => {
                let result = self.write(file_number, offset, &data);
                if let Err(ref e) = result {
                    error!(file_number, offset, len = data.len(), error = %e, "Data write failed");
                    // Reopen on the next write. Earlier bytes in the old
                    // handle still need the next sync.
                    if let Some(file) = self.current.take() {
                        self.unsynced.push(file);
                    }
                }
                let _ = done.send(result);
            }
            WriteCommand::Roll {
                file_number,
                preallocate,
            } => {
                if let Err(e) = self.roll(file_number, preallocate) {
                    // The next write to this file opens it again.
                    error!(file_number, error = %e, "Failed to prepare new data file");
                }
            }
            WriteCommand::Sync { done } => {
                let result = self.sync_all();
                if let Err(ref e) = result {
                    error!(error = %e, "Data file sync failed");
                }
                let _ = done.send(result);
            }
            WriteCommand::Release { done } => {
                if let Err(e) = self.sync_all() {
                    debug!(error = %e, "Sync before release failed");
                }
                self.current = None;
                self.unsynced.clear();
                let _ = done.send(());
            }
        }
    }

    fn stream_for(&mut self, file_number: i32) -> io::Result<&mut Box<dyn FileStream>> {
        if self.current.as_ref().is_some_and(|f| f.file_number != file_number)
            && let Some(previous) = self.current.take()
        {
            self.unsynced.push(previous);
        }

        if self.current.is_none() {
            let path = data_file_path(&self.base_path, file_number);
            debug!(path = ?path, "Opening data file");
            self.current = Some(OpenFile {
                file_number,
                stream: self.driver.open_write(&path)?,
            });
        }

        match self.current.as_mut() {
            Some(file) => Ok(&mut file.stream),
            None => Err(io::Error::other("data file not open")),
        }
    }

    fn write(&mut self, file_number: i32, offset: u64, data: &[u8]) -> io::Result<()> {
        let stream = self.stream_for(file_number)?;
        stream.seek(SeekFrom::Start(offset))?;
        stream.write_all(data)
    }

    fn roll(&mut self, file_number: i32, preallocate: u64) -> io::Result<()> {
        let stream = self.stream_for(file_number)?;
        if stream.size()? < preallocate {
            stream.set_len(preallocate)?;
        }
        debug!(file_number, preallocate, "Rolled to new data file");
        Ok(())
    }

    /// Syncs every open handle. Handles that fail stay queued, so the next
    /// sync reports them again instead of succeeding over unsynced bytes.
    fn sync_all(&mut self) -> io::Result<()> {
        let mut first_error = None;
        let mut failed = Vec::new();
        for mut file in self.unsynced.drain(..) {
            if let Err(e) = file.stream.sync() {
                warn!(file_number = file.file_number, error = %e, "Failed to sync rolled data file");
                first_error.get_or_insert(e);
                failed.push(file);
            }
        }
        self.unsynced = failed;

        if let Some(file) = self.current.as_mut()
            && let Err(e) = file.stream.sync()
        {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }
}
