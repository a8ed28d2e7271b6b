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

//! Value types shared by the streaming stack.
//!
//! * [`RequestPath`] and [`PathAliases`] identify the files requests operate on.
//! * [`CompressionTag`] and [`CompressionInfo`] describe entries inside archives.
//! * [`streamer_types`] holds request statuses, memory recommendations, and the
//!   request memory allocator contract.

pub mod compression;
pub mod path;
pub mod streamer_types;

pub use compression::{CompressionInfo, CompressionTag, ConflictResolution, DecompressionFunc};
pub use path::{PathAliases, PathError, RequestPath, EMPTY_PATH_HASH, INVALID_PATH_HASH};
pub use streamer_types::{
    AllocatedBuffer, MemoryType, Recommendations, RequestMemoryAllocation,
    RequestMemoryAllocator, RequestStatus, STATISTICS_WINDOW_SIZE,
};
