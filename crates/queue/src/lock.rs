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

//! Advisory lock on a queue directory.
//!
//! The lock is a file created exclusively inside the directory. It records
//! who holds it so that a lock left behind by a process that has since exited
//! can be told apart from a live one and reclaimed.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        OnceLock,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::error::{LockedSnafu, Result};

/// Encoded size of a [`LockHolder`].
pub const HOLDER_SIZE: usize = 16;

/// Attempts made while the lock file is being created or removed by someone
/// else at the same time.
const CREATE_RETRIES: u32 = 5;
const CREATE_BACKOFF: Duration = Duration::from_millis(10);

/// Serializes lock acquisition inside this process.
static ACQUIRE: Mutex<()> = Mutex::new(());

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Identity stored in the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub process_id:    u32,
    pub thread_id:     u32,
    /// Process start time in seconds since the epoch, 0 if unknown.
    pub process_start: u64,
}

impl LockHolder {
    /// Identity of the calling thread.
    pub fn current() -> Self {
        Self {
            process_id:    std::process::id(),
            thread_id:     THREAD_ID.with(|id| *id),
            process_start: current_process_start(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HOLDER_SIZE] {
        let mut buf = BytesMut::with_capacity(HOLDER_SIZE);
        buf.put_u32_le(self.process_id);
        buf.put_u32_le(self.thread_id);
        buf.put_u64_le(self.process_start);

        let mut out = [0u8; HOLDER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Option<Self> {
        if bytes.remaining() < HOLDER_SIZE {
            return None;
        }
        Some(Self {
            process_id:    bytes.get_u32_le(),
            thread_id:     bytes.get_u32_le(),
            process_start: bytes.get_u64_le(),
        })
    }

    /// Whether this holder still owns its lock, as seen from `me`.
    fn is_alive(&self, me: &Self) -> bool {
        if self.process_id == me.process_id {
            // Same pid from an earlier boot or container run is not us.
            return self.process_start == 0 || self.process_start == me.process_start;
        }

        let mut sys = System::new_all();
        sys.refresh_all();
        sys.process(Pid::from_u32(self.process_id))
            .is_some_and(|p| self.process_start == 0 || p.start_time() == self.process_start)
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.process_id == std::process::id() {
            write!(f, "another thread in this process (thread id {})", self.thread_id)
        } else {
            write!(f, "another running process (process id {})", self.process_id)
        }
    }
}

fn current_process_start() -> u64 {
    static START: OnceLock<u64> = OnceLock::new();
    *START.get_or_init(|| {
        let mut sys = System::new_all();
        sys.refresh_all();
        sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| sys.process(pid).map(sysinfo::Process::start_time))
            .unwrap_or(0)
    })
}

/// A held directory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockFile {
    path:   PathBuf,
    holder: LockHolder,
    file:   Option<File>,
}

impl LockFile {
    /// Creates the lock file at `path`, reclaiming it if its holder is gone.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let me = LockHolder::current();
        let _guard = ACQUIRE.lock();

        let mut attempt = 1;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&me.encode())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), holder = ?me, "Queue lock acquired");
                    return Ok(Self {
                        path,
                        holder: me,
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match LockHolder::decode(&bytes) {
                Some(holder) if holder.is_alive(&me) => {
                    return LockedSnafu { path, holder }.fail();
                }
                Some(holder) => {
                    warn!(path = %path.display(), ?holder, "Reclaiming lock left by a process that is gone");
                }
                // Someone may still be writing it.
                None if attempt < CREATE_RETRIES => {
                    thread::sleep(CREATE_BACKOFF * attempt);
                    attempt += 1;
                    continue;
                }
                None => {
                    warn!(path = %path.display(), len = bytes.len(), "Reclaiming unreadable lock file");
                }
            }

            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
    }

    /// Removes the lock file.
    pub fn release(mut self) -> Result<()> { self.release_inner() }

    fn release_inner(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        drop(file);
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => {
                debug!(path = %self.path.display(), holder = ?self.holder, "Queue lock released");
                Ok(())
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(path = %self.path.display(), error = %e, "Failed to release queue lock");
        }
    }
}
