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

//! Typed queues on top of the byte queue.
//!
//! A [`Serializer`] turns values into item bytes and back; [`TypedQueue`]
//! and [`TypedSession`] apply it on every enqueue and dequeue.

use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::{Result, SerializationSnafu},
    queue::Queue,
    session::Session,
};

/// Conversion between values and queue item bytes.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding through `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
            SerializationSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            SerializationSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }
}

/// A [`Queue`] of `T` values.
pub struct TypedQueue<T, S = JsonSerializer> {
    queue:      Queue,
    serializer: S,
    _marker:    PhantomData<fn() -> T>,
}

impl<T> TypedQueue<T, JsonSerializer>
where
    T: Serialize + DeserializeOwned,
{
    /// Wraps `queue`, storing items as JSON.
    pub const fn json(queue: Queue) -> Self { Self::new(queue, JsonSerializer) }
}

impl<T, S: Serializer<T>> TypedQueue<T, S> {
    pub const fn new(queue: Queue, serializer: S) -> Self {
        Self {
            queue,
            serializer,
            _marker: PhantomData,
        }
    }

    pub fn open_session(&self) -> Result<TypedSession<'_, T, S>> {
        Ok(TypedSession {
            session:    self.queue.open_session()?,
            serializer: &self.serializer,
            _marker:    PhantomData,
        })
    }

    /// The underlying byte queue.
    pub const fn inner(&self) -> &Queue { &self.queue }

    pub fn close(self) -> Result<()> { self.queue.close() }
}

impl<T, S: fmt::Debug> fmt::Debug for TypedQueue<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedQueue")
            .field("queue", &self.queue)
            .field("serializer", &self.serializer)
            .finish()
    }
}

/// A [`Session`] that enqueues and dequeues `T` values.
pub struct TypedSession<'q, T, S> {
    session:    Session,
    serializer: &'q S,
    _marker:    PhantomData<fn() -> T>,
}

impl<T, S: Serializer<T>> TypedSession<'_, T, S> {
    pub fn enqueue(&mut self, value: &T) -> Result<()> {
        let bytes = self.serializer.serialize(value)?;
        self.session.enqueue(bytes)
    }

    /// Takes the next value off the queue. An item that fails to decode is
    /// still dequeued; flushing the session removes it for good.
    pub fn dequeue(&mut self) -> Result<Option<T>> {
        self.session
            .dequeue()?
            .map(|bytes| self.serializer.deserialize(&bytes))
            .transpose()
    }

    pub fn flush(&mut self) -> Result<()> { self.session.flush() }

    pub fn close(self) -> Result<()> { self.session.close() }
}

impl<T, S> fmt::Debug for TypedSession<'_, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSession")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
