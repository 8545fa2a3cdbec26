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

//! Reopening queues whose files were left in a bad state.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use bytes::Bytes;
use diskq::{Queue, QueueBuilder, QueueError};
use tempfile::TempDir;

/// Shows the queue's recovery warnings when run with `--nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn builder(path: &Path) -> QueueBuilder {
    QueueBuilder::new(path)
        .paranoid_flushing(false)
        .trim_log_on_dispose(false)
}

/// One transaction per item, log left untrimmed.
fn write_items(path: &Path, items: &[&'static [u8]]) {
    let queue = builder(path).build().unwrap();
    for item in items {
        let mut session = queue.open_session().unwrap();
        session.enqueue(*item).unwrap();
        session.flush().unwrap();
    }
    queue.close().unwrap();
}

fn drain(queue: &Queue) -> Vec<Bytes> {
    let mut session = queue.open_session().unwrap();
    let mut items = Vec::new();
    while let Some(item) = session.dequeue().unwrap() {
        items.push(item);
    }
    session.flush().unwrap();
    items
}

fn log_path(path: &Path) -> std::path::PathBuf { path.join("transaction.log") }

fn truncate_log(path: &Path, by: u64) {
    let file = OpenOptions::new().write(true).open(log_path(path)).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - by).unwrap();
}

#[test]
fn test_torn_tail_is_dropped_in_lenient_mode() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"a", b"b", b"c"]);
    truncate_log(temp_dir.path(), 5);

    let queue = builder(temp_dir.path()).strict(false).build().unwrap();
    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_torn_tail_is_dropped_in_strict_mode() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"a", b"b", b"c"]);
    // Cut inside the end marker of the last transaction.
    truncate_log(temp_dir.path(), 3);

    let queue = builder(temp_dir.path()).strict(true).build().unwrap();
    assert_eq!(queue.estimated_count(), 2);

    // The torn bytes are gone once the log has been rewritten.
    let trimmed = fs::read(log_path(temp_dir.path())).unwrap();
    assert_eq!(trimmed.len(), 36 + 2 * 17);
    queue.close().unwrap();
}

#[test]
fn test_garbage_after_log_fails_strict_open() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"a", b"b"]);
    let mut log = OpenOptions::new()
        .append(true)
        .open(log_path(temp_dir.path()))
        .unwrap();
    log.write_all(&[0xAB; 40]).unwrap();
    drop(log);

    let err = builder(temp_dir.path()).strict(true).build().unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(matches!(err, QueueError::LogCorrupted { transaction: 3, .. }));
    // A failed open does not leave the queue locked.
    assert!(!temp_dir.path().join("lock").exists());

    let queue = builder(temp_dir.path()).strict(false).build().unwrap();
    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_trim_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"one", b"two", b"three"]);

    let queue = builder(temp_dir.path()).build().unwrap();
    let mut session = queue.open_session().unwrap();
    session.dequeue().unwrap();
    session.flush().unwrap();
    drop(session);

    queue.trim_log().unwrap();
    let first = fs::read(log_path(temp_dir.path())).unwrap();
    queue.trim_log().unwrap();
    let second = fs::read(log_path(temp_dir.path())).unwrap();
    assert_eq!(first, second);
    queue.close().unwrap();

    let queue = builder(temp_dir.path()).build().unwrap();
    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"two"),
        Bytes::from_static(b"three")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_untrimmed_log_replays_dequeues() {
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"x", b"y", b"z"]);
    {
        let queue = builder(temp_dir.path()).build().unwrap();
        let mut session = queue.open_session().unwrap();
        assert_eq!(session.dequeue().unwrap().unwrap(), &b"x"[..]);
        session.flush().unwrap();
        drop(session);
        queue.close().unwrap();
    }

    let queue = builder(temp_dir.path()).build().unwrap();
    assert_eq!(queue.estimated_count(), 2);
    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"y"),
        Bytes::from_static(b"z")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_checked_out_item_survives_abandoned_session() {
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"first", b"second"]);
    {
        let queue = Queue::open(temp_dir.path()).unwrap();
        let mut session = queue.open_session().unwrap();
        assert_eq!(session.dequeue().unwrap().unwrap(), &b"first"[..]);
        // The session never gets to reinstate its dequeue.
        std::mem::forget(session);
        queue.close().unwrap();
    }

    let queue = Queue::open(temp_dir.path()).unwrap();
    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"first"),
        Bytes::from_static(b"second")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_missing_meta_does_not_overwrite_items() {
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"kept"]);
    fs::remove_file(temp_dir.path().join("meta.state")).unwrap();

    let queue = builder(temp_dir.path()).build().unwrap();
    let mut session = queue.open_session().unwrap();
    session.enqueue(&b"new"[..]).unwrap();
    session.flush().unwrap();
    drop(session);

    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"kept"),
        Bytes::from_static(b"new")
    ]);
    queue.close().unwrap();
}

#[test]
fn test_truncated_data_file() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    write_items(temp_dir.path(), &[b"abc", b"def"]);
    OpenOptions::new()
        .write(true)
        .open(temp_dir.path().join("data.0"))
        .unwrap()
        .set_len(0)
        .unwrap();

    {
        let queue = builder(temp_dir.path()).build().unwrap();
        let mut session = queue.open_session().unwrap();
        let err = session.dequeue().unwrap_err();
        assert!(
            matches!(err, QueueError::DataRead {
                file_number: 0,
                start: 0,
                ..
            }),
            "{err}"
        );
        drop(session);
        assert_eq!(queue.estimated_count(), 2);
        queue.close().unwrap();
    }

    let queue = builder(temp_dir.path())
        .allow_truncated_entries(true)
        .build()
        .unwrap();
    let mut session = queue.open_session().unwrap();
    assert_eq!(session.dequeue().unwrap(), None);
    session.flush().unwrap();
    drop(session);
    // The unreadable item is gone for good once flushed.
    assert_eq!(queue.estimated_count(), 1);
    queue.close().unwrap();
}
