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

//! Crash-safe, file-backed FIFO queue.
//!
//! Items are appended to rolling data files (`data.N`) and become visible
//! only once a transaction describing them has been appended to
//! `transaction.log` and synced. On open the log is replayed to rebuild the
//! queue; a torn last transaction is dropped.
//!
//! ```text
//! Session::enqueue ──► Appender ──► IOWorker ──► data.N
//!        │
//! Session::flush ────► Engine::commit ──► transaction.log
//!                            │
//!                            └──► EntryIndex ──► Session::dequeue
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod file;
pub mod path;
pub mod typed;

mod appender;
mod engine;
mod entry;
mod index;
mod io_worker;
mod lock;
mod meta;
mod operation;
mod queue;
mod recovery;
mod session;
mod txlog;

pub use builder::QueueBuilder;
pub use config::{QueueConfig, global_defaults, set_global_defaults};
pub use error::{QueueError, Result};
pub use file::{FileDriver, FileStream, StandardFileDriver};
pub use lock::LockHolder;
pub use operation::{Operation, OperationType};
pub use queue::Queue;
pub use session::Session;
pub use typed::{JsonSerializer, Serializer, TypedQueue, TypedSession};
