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

//! Allocation schemas and allocation-source adapters.

mod heap;
mod malloc_schema;
mod os_allocator;
mod request_memory;
mod tracking_source;

pub use malloc_schema::MallocSchema;
pub use os_allocator::{OsAllocator, OsAllocatorDescriptor};
pub use request_memory::DefaultRequestMemoryAllocator;
pub use tracking_source::TrackingSource;
