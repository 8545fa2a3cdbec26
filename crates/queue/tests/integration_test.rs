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

use std::{path::Path, thread};

use bytes::Bytes;
use diskq::{Queue, QueueBuilder, QueueError, TypedQueue};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

const START_MARKER: [u8; 16] = [
    0x12, 0xfb, 0x5b, 0xb7, 0xbb, 0x93, 0xb6, 0x42, 0xac, 0xb1, 0xa8, 0x97, 0x23, 0x9e, 0xa3, 0xa5,
];
const END_MARKER: [u8; 16] = [
    0x05, 0x97, 0x6c, 0x86, 0x56, 0x44, 0x9d, 0x4e, 0xb4, 0x52, 0x31, 0x46, 0xb3, 0xbf, 0xa4, 0xce,
];

fn enqueue_all(queue: &Queue, items: &[&[u8]]) {
    let mut session = queue.open_session().unwrap();
    for item in items {
        session.enqueue(Bytes::copy_from_slice(item)).unwrap();
    }
    session.flush().unwrap();
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

fn open(path: &Path) -> Queue { Queue::open(path).unwrap() }

#[test]
fn test_fifo_order_across_restart() {
    let temp_dir = TempDir::new().unwrap();
    let expected: Vec<Vec<u8>> = (0..100).map(|i| format!("msg-{i:03}").into_bytes()).collect();

    {
        let queue = open(temp_dir.path());
        let items: Vec<&[u8]> = expected.iter().map(Vec::as_slice).collect();
        enqueue_all(&queue, &items);
        assert_eq!(queue.estimated_count(), 100);
        queue.close().unwrap();
    }

    let queue = open(temp_dir.path());
    let items = drain(&queue);
    assert_eq!(items.len(), 100);
    for (item, expected) in items.iter().zip(&expected) {
        assert_eq!(item, expected);
    }
    assert_eq!(queue.estimated_count(), 0);
    queue.close().unwrap();
}

#[test]
fn test_unflushed_dequeue_is_reinstated() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());
    enqueue_all(&queue, &[&[1, 2, 3, 4]]);

    {
        let mut session = queue.open_session().unwrap();
        assert_eq!(session.dequeue().unwrap().unwrap(), &[1u8, 2, 3, 4][..]);
    }

    let mut session = queue.open_session().unwrap();
    assert_eq!(session.dequeue().unwrap().unwrap(), &[1u8, 2, 3, 4][..]);
    session.flush().unwrap();
    drop(session);
    assert_eq!(queue.estimated_count(), 0);
    queue.close().unwrap();
}

#[test]
fn test_reinstated_items_keep_their_order() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());
    enqueue_all(&queue, &[b"a", b"b", b"c"]);

    {
        let mut session = queue.open_session().unwrap();
        session.dequeue().unwrap();
        session.dequeue().unwrap();
    }

    assert_eq!(drain(&queue), vec![
        Bytes::from_static(b"a"),
        Bytes::from_static(b"b"),
        Bytes::from_static(b"c"),
    ]);
    queue.close().unwrap();
}

#[test]
fn test_unflushed_enqueue_is_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());

    {
        let mut session = queue.open_session().unwrap();
        session.enqueue(&b"lost"[..]).unwrap();
    }
    assert_eq!(queue.estimated_count(), 0);
    assert!(drain(&queue).is_empty());
    queue.close().unwrap();
}

#[test]
fn test_item_delivered_to_one_session_only() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());
    enqueue_all(&queue, &[b"only"]);

    let mut first = queue.open_session().unwrap();
    let mut second = queue.open_session().unwrap();
    let a = first.dequeue().unwrap();
    let b = second.dequeue().unwrap();

    assert!(a.is_some() ^ b.is_some());
    first.flush().unwrap();
    second.flush().unwrap();
    drop((first, second));
    queue.close().unwrap();
}

#[test]
fn test_concurrent_consumers_share_items() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());
    let items: Vec<Vec<u8>> = (0u32..200).map(|i| i.to_le_bytes().to_vec()).collect();
    let refs: Vec<&[u8]> = items.iter().map(Vec::as_slice).collect();
    enqueue_all(&queue, &refs);

    let mut received: Vec<u32> = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut seen = Vec::new();
                    loop {
                        let mut session = queue.open_session().unwrap();
                        let Some(item) = session.dequeue().unwrap() else {
                            break;
                        };
                        session.flush().unwrap();
                        seen.push(u32::from_le_bytes(item[..].try_into().unwrap()));
                    }
                    seen
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    received.sort_unstable();
    assert_eq!(received, (0..200).collect::<Vec<_>>());
    assert_eq!(queue.estimated_count(), 0);
    queue.close().unwrap();
}

#[test]
fn test_rollover_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = Queue::open_with(temp_dir.path(), 10, true).unwrap();
        let mut session = queue.open_session().unwrap();
        for i in 0..11u8 {
            session.enqueue(vec![i]).unwrap();
        }
        session.flush().unwrap();
        drop(session);

        assert_eq!(queue.current_file_number(), 1);
        assert_eq!(queue.max_file_size(), 10);
        queue.close().unwrap();
    }

    let queue = Queue::open_with(temp_dir.path(), 10, true).unwrap();
    assert_eq!(queue.current_file_number(), 1);
    let items = drain(&queue);
    assert_eq!(
        items,
        (0..11u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>()
    );
    queue.close().unwrap();

    // Both data files drained; only the current one is kept.
    assert!(!temp_dir.path().join("data.0").exists());
    assert!(temp_dir.path().join("data.1").exists());
}

#[test]
fn test_zero_length_and_marker_payloads() {
    let temp_dir = TempDir::new().unwrap();
    let payloads: [&[u8]; 5] = [b"", &START_MARKER, &END_MARKER, b"", b"tail"];
    {
        let queue = open(temp_dir.path());
        for payload in payloads {
            enqueue_all(&queue, &[payload]);
        }
        queue.close().unwrap();
    }

    let queue = open(temp_dir.path());
    let items = drain(&queue);
    assert_eq!(items.len(), payloads.len());
    for (item, expected) in items.iter().zip(payloads) {
        assert_eq!(&item[..], expected);
    }
    queue.close().unwrap();
}

#[test]
fn test_large_batch_with_background_writes() {
    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .max_file_size(256 * 1024)
        .suggested_write_buffer(0)
        .paranoid_flushing(false)
        .build()
        .unwrap();

    let mut session = queue.open_session().unwrap();
    for i in 0..300u32 {
        let mut item = vec![0u8; 4096];
        item[..4].copy_from_slice(&i.to_le_bytes());
        session.enqueue(item).unwrap();
    }
    session.flush().unwrap();
    drop(session);
    assert!(queue.current_file_number() >= 4);
    queue.close().unwrap();

    let queue = open(temp_dir.path());
    let items = drain(&queue);
    assert_eq!(items.len(), 300);
    for (i, item) in (0u32..).zip(&items) {
        assert_eq!(item.len(), 4096);
        assert_eq!(&item[..4], &i.to_le_bytes());
    }
    queue.close().unwrap();
}

#[test]
fn test_hard_delete_with_reset() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());
    enqueue_all(&queue, &[b"one", b"two"]);
    let stale = queue.open_session().unwrap();

    queue.hard_delete(true).unwrap();
    assert_eq!(queue.estimated_count(), 0);
    assert_eq!(queue.current_file_number(), 0);
    drop(stale);

    enqueue_all(&queue, &[b"fresh"]);
    queue.close().unwrap();

    let queue = open(temp_dir.path());
    assert_eq!(drain(&queue), vec![Bytes::from_static(b"fresh")]);
    queue.close().unwrap();
}

#[test]
fn test_lock_conflict_from_another_thread() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open(temp_dir.path());

    let path = temp_dir.path().to_path_buf();
    let err = thread::spawn(move || Queue::open(path).unwrap_err())
        .join()
        .unwrap();
    assert!(err.is_lock_conflict());
    match err {
        QueueError::Locked { holder, .. } => {
            assert_eq!(holder.process_id, std::process::id());
            assert!(holder.to_string().contains("another thread"));
        }
        other => panic!("unexpected error: {other}"),
    }
    queue.close().unwrap();
}

#[test]
fn test_close_releases_lock() {
    let temp_dir = TempDir::new().unwrap();
    open(temp_dir.path()).close().unwrap();
    assert!(!temp_dir.path().join("lock").exists());
    open(temp_dir.path()).close().unwrap();
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Order {
    id:       u64,
    quantity: u32,
}

#[test]
fn test_typed_queue() {
    let temp_dir = TempDir::new().unwrap();
    let queue = TypedQueue::<Order>::json(open(temp_dir.path()));

    let mut session = queue.open_session().unwrap();
    for id in 0..3 {
        session.enqueue(&Order { id, quantity: 2 }).unwrap();
    }
    session.flush().unwrap();
    drop(session);

    let mut session = queue.open_session().unwrap();
    assert_eq!(
        session.dequeue().unwrap(),
        Some(Order { id: 0, quantity: 2 })
    );
    session.close().unwrap();

    assert_eq!(queue.inner().estimated_count(), 2);
    queue.close().unwrap();
}
