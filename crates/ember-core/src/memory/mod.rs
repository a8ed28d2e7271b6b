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

//! Allocation contracts for the engine.
//!
//! The memory layer is split in three levels:
//!
//! 1. [`AllocationSource`] is the raw allocate/deallocate/resize contract. Concrete
//!    schemas (OS, malloc, tracking wrappers) live in `ember-data`.
//! 2. [`Allocator`] is a named object that forwards to a *current* source which can
//!    be redirected at runtime (e.g. through a profiling source) and reset back to
//!    the original one.
//! 3. [`AllocatorRegistry`] owns one canonical [`Allocator`] per tag type and is
//!    passed explicitly to the subsystems that need it.
//!
//! [`AllocatorStats`] and [`StatsCounters`] give every schema the same accounting
//! vocabulary.

mod allocator;
mod registry;
mod source;
mod stats;

pub use allocator::Allocator;
pub use registry::{AllocatorRegistry, AllocatorTag, RegistryError};
pub use source::{
    align_up, AllocationFlags, AllocationSite, AllocationSource, OutOfMemoryHandler,
    OutOfMemoryReport,
};
pub use stats::{AllocatorStats, StatsCounters};
