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

//! Fixed file names inside a queue directory. Existing queues depend on them.

use std::path::{Path, PathBuf};

/// Advisory lock file.
pub const LOCK_FILE: &str = "lock";

/// Write-ahead transaction log.
pub const TRANSACTION_LOG: &str = "transaction.log";

/// Write head record: current data file number and position.
pub const META_FILE: &str = "meta.state";

/// Prefix of rolling data files, followed by the file number.
pub const DATA_FILE_PREFIX: &str = "data.";

/// Returns `base/lock`.
pub fn lock_path<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(LOCK_FILE) }

/// Returns `base/transaction.log`.
pub fn transaction_log_path<P: AsRef<Path>>(base: P) -> PathBuf {
    base.as_ref().join(TRANSACTION_LOG)
}

/// Returns `base/meta.state`.
pub fn meta_path<P: AsRef<Path>>(base: P) -> PathBuf { base.as_ref().join(META_FILE) }

/// Returns `base/data.N`.
pub fn data_file_path<P: AsRef<Path>>(base: P, file_number: i32) -> PathBuf {
    base.as_ref().join(format!("{DATA_FILE_PREFIX}{file_number}"))
}

/// Extracts `N` from a `data.N` file name.
pub fn data_file_number<P: AsRef<Path>>(path: P) -> Option<i32> {
    path.as_ref()
        .file_name()?
        .to_str()?
        .strip_prefix(DATA_FILE_PREFIX)?
        .parse()
        .ok()
}
