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

//! I/O services of the engine: compressed streams, pack archives, and the
//! asynchronous file streamer.
//!
//! The streamer is built as a stack of stages (see [`streaming::StreamStack`]).
//! Requests enter the head of the stack; each stage may transform, serve, or
//! forward them; the last stage talks to the storage device and reports
//! completion through the shared [`streaming::StreamerContext`].

pub mod compression;
pub mod config;
pub mod error;
pub mod stream;
pub mod streaming;

pub use config::StreamerConfig;
pub use error::{StreamError, StreamResult};
pub use streaming::{RequestHandle, Streamer};
