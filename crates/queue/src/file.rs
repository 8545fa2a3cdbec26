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

//! Filesystem access used by the queue engine.
//!
//! Everything the engine does to disk goes through a [`FileDriver`], which is
//! fixed when the queue is opened. [`StandardFileDriver`] is the real
//! implementation; tests inject drivers that fail on purpose.

use std::{
    ffi::OsString,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Attempts made by atomic reads, writes and renames.
pub const RETRY_LIMIT: u32 = 10;

/// Sleep between attempts grows linearly by this step.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

const BACKUP_SUFFIX: &str = ".old_copy";
const DELETE_MARKER: &str = "_dc_";

/// An open file handle.
pub trait FileStream: Read + Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Flushes buffered data and forces it to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;
}

impl FileStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> { Self::set_len(self, len) }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }

    fn size(&self) -> io::Result<u64> { Ok(self.metadata()?.len()) }
}

/// Filesystem operations needed by the queue.
pub trait FileDriver: Send + Sync + fmt::Debug + 'static {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Opens for appending, creating the file if needed.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileStream>>;

    /// Opens for positioned writes, creating the file if needed. Existing
    /// contents are kept.
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileStream>>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn FileStream>>;

    /// Reads the whole file, recovering from an interrupted
    /// [`atomic_write`](Self::atomic_write). `None` if the file does not exist.
    fn atomic_read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the file contents so that a crash leaves either the old or
    /// the new contents recoverable.
    fn atomic_write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Moves the file out of the way and schedules it for deletion.
    fn prepare_delete(&self, path: &Path) -> io::Result<()>;

    /// Deletes every file scheduled by [`prepare_delete`](Self::prepare_delete).
    fn finalize_deletes(&self) -> io::Result<()>;

    /// Removes a directory and everything in it.
    fn delete_recursive(&self, path: &Path) -> io::Result<()>;

    /// Paths of the entries directly inside `path`.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// [`FileDriver`] backed by `std::fs`.
#[derive(Debug, Default)]
pub struct StandardFileDriver {
    set_permissions: bool,
    pending_deletes: Mutex<Vec<PathBuf>>,
}

impl StandardFileDriver {
    pub fn new() -> Self { Self::default() }

    /// Best-effort read/write-for-all permissions on files this driver
    /// creates.
    #[must_use]
    pub const fn with_permissions(mut self, enabled: bool) -> Self {
        self.set_permissions = enabled;
        self
    }

    fn after_create(&self, path: &Path) {
        if self.set_permissions {
            allow_read_write_for_all(path);
        }
    }
}

impl FileDriver for StandardFileDriver {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> { fs::create_dir_all(path) }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileStream>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.after_create(path);
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileStream>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        self.after_create(path);
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn FileStream>> {
        Ok(Box::new(File::open(path)?))
    }

    fn atomic_read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let backup = backup_path(path);
        with_retries("atomic read", path, || {
            if backup.exists() {
                warn!(path = %path.display(), "Restoring file from interrupted atomic write");
                fs::rename(&backup, path)?;
            }
            match fs::read(path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn atomic_write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let backup = backup_path(path);
        with_retries("atomic write", path, || {
            // An existing backup is the last known good copy; keep it.
            if path.exists() && !backup.exists() {
                fs::rename(path, &backup)?;
            }

            let mut file = File::create(path)?;
            file.write_all(contents)?;
            file.sync_all()?;
            self.after_create(path);

            match fs::remove_file(&backup) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        })
    }

    fn prepare_delete(&self, path: &Path) -> io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let target = delete_path(path);
        with_retries("rename for delete", path, || fs::rename(path, &target))?;
        self.pending_deletes.lock().push(target);
        Ok(())
    }

    fn finalize_deletes(&self) -> io::Result<()> {
        let pending = std::mem::take(&mut *self.pending_deletes.lock());
        let mut result = Ok(());
        for path in pending {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Deleted file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete file");
                    result = Err(e);
                }
            }
        }
        result
    }

    fn delete_recursive(&self, path: &Path) -> io::Result<()> {
        let path = std::path::absolute(path)?;
        if path.parent().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request to delete root directory rejected",
            ));
        }
        if path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tried to recursively delete a single file",
            ));
        }
        fs::remove_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }
}

/// Whether `path` was renamed by [`FileDriver::prepare_delete`] and never
/// removed.
pub fn is_pending_delete(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(DELETE_MARKER))
}

/// Runs `op` up to [`RETRY_LIMIT`] times, sleeping `attempt * RETRY_BACKOFF`
/// between attempts.
fn with_retries<T>(what: &str, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= RETRY_LIMIT => {
                warn!(path = %path.display(), error = %e, "Exceeded retry limit during {what}");
                return Err(e);
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "Retrying {what}");
                thread::sleep(RETRY_BACKOFF * attempt);
                attempt += 1;
            }
        }
    }
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map_or_else(OsString::new, OsString::from);
    name.push(suffix);
    path.with_file_name(name)
}

fn backup_path(path: &Path) -> PathBuf { append_to_file_name(path, BACKUP_SUFFIX) }

fn delete_path(path: &Path) -> PathBuf {
    append_to_file_name(
        path,
        &format!("{DELETE_MARKER}{}", uuid::Uuid::new_v4().simple()),
    )
}

#[cfg(unix)]
fn allow_read_write_for_all(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
        debug!(path = %path.display(), error = %e, "Could not relax file permissions");
    }
}

#[cfg(not(unix))]
fn allow_read_write_for_all(_path: &Path) {}
