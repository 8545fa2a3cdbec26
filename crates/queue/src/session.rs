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

//! Unit of work against a queue.
//!
//! A [`Session`] collects enqueues and dequeues and makes them visible to
//! other sessions all at once, on [`Session::flush`]. Dropping a session
//! without flushing puts its dequeued items back at the head of the queue and
//! forgets its enqueues.

use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    appender::{InFlightWrite, recv_done},
    engine::Engine,
    error::{PendingWriteSnafu, Result},
    operation::{Operation, OperationType},
};

/// Bytes handed to the I/O worker before the session was flushed.
#[derive(Debug)]
struct Speculative {
    write:    InFlightWrite,
    payloads: Vec<Bytes>,
}

/// A batch of queue operations that commit together.
///
/// ```ignore
/// let mut session = queue.open_session()?;
/// session.enqueue(&b"hello"[..])?;
/// session.flush()?;
/// ```
#[derive(Debug)]
pub struct Session {
    engine:            Arc<Engine>,
    epoch:             u64,
    /// Uncommitted operations in the order they happened.
    operations:        Vec<Operation>,
    /// Enqueued payloads not yet handed to the I/O worker.
    buffer:            Vec<Bytes>,
    buffer_size:       usize,
    write_buffer_size: usize,
    in_flight:         Vec<Speculative>,
}

impl Session {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        let write_buffer_size = engine.config().write_buffer_size();
        let epoch = engine.epoch();
        Self {
            engine,
            epoch,
            operations: Vec::new(),
            buffer: Vec::new(),
            buffer_size: 0,
            write_buffer_size,
            in_flight: Vec::new(),
        }
    }

    /// Adds an item to the session.
    ///
    /// Once enough bytes are buffered they are written to the data file in
    /// the background, but nothing becomes visible before `flush`.
    pub fn enqueue(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.engine.ensure_usable(self.epoch)?;
        let data = data.into();
        self.buffer_size += data.len();
        self.buffer.push(data);

        if self.buffer_size > self.write_buffer_size {
            self.write_buffered()?;
        }
        Ok(())
    }

    /// Takes the next item off the queue, `None` if it is empty.
    ///
    /// The item stays reserved for this session until it is flushed (gone for
    /// good) or the session is dropped (back at the head of the queue).
    pub fn dequeue(&mut self) -> Result<Option<Bytes>> {
        let Some(entry) = self.engine.dequeue(self.epoch)? else {
            return Ok(None);
        };
        self.operations.push(Operation::dequeue(&entry));
        // An unreadable entry is dropped when the session commits.
        Ok(entry.data)
    }

    /// Makes every operation of this session durable and visible.
    ///
    /// Waits for background writes, writes what is still buffered, forces
    /// the data to disk, then commits one transaction. When a data write
    /// fails nothing is committed, the session's enqueues are buffered again
    /// and its dequeues stay pending, so calling `flush` again retries.
    pub fn flush(&mut self) -> Result<()> {
        self.engine.ensure_usable(self.epoch)?;
        if !self.buffer.is_empty() {
            self.write_buffered()?;
        }

        if !self.in_flight.is_empty()
            && let Err(e) = self.wait_for_writes()
        {
            self.rewind_writes();
            return Err(e);
        }
        self.in_flight.clear();

        self.engine.commit(&mut self.operations, self.epoch)
    }

    /// Flushes and drops the session.
    pub fn close(mut self) -> Result<()> { self.flush() }

    pub(crate) const fn epoch(&self) -> u64 { self.epoch }

    /// Operations waiting for the next flush.
    pub fn pending_operations(&self) -> &[Operation] { &self.operations }

    fn write_buffered(&mut self) -> Result<()> {
        let payloads = std::mem::take(&mut self.buffer);
        match self.engine.appender().append(&payloads) {
            Ok(write) => {
                self.operations.extend_from_slice(&write.operations);
                self.buffer_size = 0;
                self.in_flight.push(Speculative { write, payloads });
                Ok(())
            }
            Err(e) => {
                self.buffer = payloads;
                Err(e)
            }
        }
    }

    fn wait_for_writes(&self) -> Result<()> {
        let timeout = self.engine.config().io_timeout;
        let mut failures = Vec::new();

        for speculative in &self.in_flight {
            failures.extend(
                speculative
                    .write
                    .wait(timeout)?
                    .into_iter()
                    .map(|e| e.to_string()),
            );
        }
        if failures.is_empty() {
            let done = self.engine.appender().sync()?;
            if let Err(e) = recv_done(&done, timeout)? {
                failures.push(format!("sync: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            PendingWriteSnafu { failures }.fail()
        }
    }

    /// Forgets where failed writes went and buffers their payloads again.
    fn rewind_writes(&mut self) {
        let mut payloads = Vec::new();
        let mut discarded = HashSet::new();
        for speculative in self.in_flight.drain(..) {
            discarded.extend(speculative.write.operations.iter().copied());
            self.engine
                .appender()
                .unreserve(&speculative.write.operations);
            payloads.extend(speculative.payloads);
        }
        self.operations.retain(|op| !discarded.contains(op));

        payloads.append(&mut self.buffer);
        self.buffer_size = payloads.iter().map(Bytes::len).sum();
        self.buffer = payloads;
        debug!(
            items = self.buffer.len(),
            "Rewound failed writes into the session buffer"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.operations.is_empty() {
            return;
        }
        let enqueues: Vec<Operation> = self
            .operations
            .iter()
            .copied()
            .filter(|op| op.kind == OperationType::Enqueue)
            .collect();
        self.engine.appender().unreserve(&enqueues);
        self.engine.reinstate(&self.operations, self.epoch);

        if !enqueues.is_empty() && !std::thread::panicking() {
            warn!(
                discarded = enqueues.len(),
                "Session dropped with unflushed enqueues"
            );
        }
    }
}
