// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The asynchronous file streamer.
//!
//! Requests are created by the [`Streamer`], prepared and queued through a
//! [`StreamStack`] of stages, executed by the stage that owns them, and handed
//! back through the [`StreamerContext`], which runs completion callbacks and
//! wakes waiting [`RequestHandle`]s.

mod context;
mod request;
mod stack;
pub mod stages;
mod statistics;
mod streamer;

pub use context::{StreamEvent, StreamerContext, MAXIMUM_WAIT_OBJECTS};
pub use request::{
    AllocatorLease, CompletionCallback, CompressedReadData, FailureReason, FileRequest,
    FileRequestPtr, ReadBuffer, ReadOutput, ReadRequestData, RequestCommand, RequestHandle,
    READ_TO_END,
};
pub use stack::{Next, NextRef, Status, StreamStack, StreamStackEntry};
pub use statistics::{AverageWindow, ScopedTimer, Statistic};
pub use streamer::Streamer;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
