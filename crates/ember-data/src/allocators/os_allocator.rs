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

//! The allocation schema that talks to the operating system.

use std::alloc::System;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use ember_core::memory::{
    AllocationFlags, AllocationSite, AllocationSource, AllocatorStats, StatsCounters,
};

use super::heap::HeaderedHeap;

/// Creation parameters for an [`OsAllocator`].
#[derive(Clone)]
pub struct OsAllocatorDescriptor {
    /// A source to delegate every call to instead of the system allocator.
    pub custom_source: Option<Arc<dyn AllocationSource>>,
    /// Upper bound on the bytes handed out at once.
    pub capacity: usize,
}

impl Default for OsAllocatorDescriptor {
    fn default() -> Self {
        Self {
            custom_source: None,
            capacity: usize::MAX,
        }
    }
}

impl fmt::Debug for OsAllocatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsAllocatorDescriptor")
            .field("custom_source", &self.custom_source.is_some())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Allocates straight from the system allocator.
///
/// This schema has no dependencies on any other engine subsystem, so it is the
/// one to use before the allocator registry exists and after it is gone.
/// [`destroy`](Self::destroy) does not release anything: every block goes back
/// to the system on its own `deallocate`.
pub struct OsAllocator {
    heap: HeaderedHeap<System>,
    custom: Option<Arc<dyn AllocationSource>>,
    custom_counters: StatsCounters,
}

impl OsAllocator {
    /// Creates the schema from `descriptor`.
    pub fn create(descriptor: OsAllocatorDescriptor) -> Self {
        log::debug!("Creating OS allocator ({descriptor:?})");
        Self {
            heap: HeaderedHeap::new(System, descriptor.capacity),
            custom: descriptor.custom_source,
            custom_counters: StatsCounters::new(),
        }
    }

    /// Tears the schema down.
    pub fn destroy(&self) {
        let outstanding = self.num_allocated_bytes();
        if outstanding > 0 {
            log::debug!("OS allocator destroyed with {outstanding} bytes still handed out");
        }
    }

    /// Returns `true` if calls are delegated to a custom source.
    pub fn has_custom_source(&self) -> bool {
        self.custom.is_some()
    }
}

impl Default for OsAllocator {
    fn default() -> Self {
        Self::create(OsAllocatorDescriptor::default())
    }
}

impl AllocationSource for OsAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
        site: AllocationSite,
    ) -> Option<NonNull<u8>> {
        match &self.custom {
            Some(custom) => {
                let ptr = custom.allocate(size, alignment, flags, site)?;
                self.custom_counters.record_allocation(size);
                Some(ptr)
            }
            None => self.heap.allocate(size, alignment, flags),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        match &self.custom {
            Some(custom) => {
                custom.deallocate(ptr, size, alignment);
                self.custom_counters.record_deallocation(size);
            }
            None => self.heap.deallocate(ptr, size),
        }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        match &self.custom {
            Some(custom) => {
                let old_size = custom.allocation_size(ptr);
                let size = custom.resize(ptr, new_size);
                self.custom_counters.record_reallocation(old_size, size);
                size
            }
            None => self.heap.resize(ptr, new_size),
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        match &self.custom {
            Some(custom) => {
                let old_size = ptr.map_or(0, |ptr| custom.allocation_size(ptr));
                let result = custom.reallocate(ptr, new_size, new_alignment);
                match (ptr.is_some(), result.is_some()) {
                    (false, true) => self.custom_counters.record_allocation(new_size),
                    (true, true) => self.custom_counters.record_reallocation(old_size, new_size),
                    (true, false) if new_size == 0 => {
                        self.custom_counters.record_deallocation(old_size)
                    }
                    _ => {}
                }
                result
            }
            None => self.heap.reallocate(ptr, new_size, new_alignment),
        }
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        match &self.custom {
            Some(custom) => custom.allocation_size(ptr),
            None => self.heap.allocation_size(ptr),
        }
    }

    fn num_allocated_bytes(&self) -> usize {
        match &self.custom {
            Some(_) => self.custom_counters.current_bytes(),
            None => self.heap.num_allocated_bytes(),
        }
    }

    fn capacity(&self) -> usize {
        match &self.custom {
            Some(custom) => custom.capacity(),
            None => self.heap.capacity(),
        }
    }

    fn max_allocation_size(&self) -> usize {
        match &self.custom {
            Some(custom) => custom.max_allocation_size(),
            None => self.heap.max_allocation_size(),
        }
    }

    fn garbage_collect(&self) {
        if let Some(custom) = &self.custom {
            custom.garbage_collect();
        }
    }

    fn stats(&self) -> Option<AllocatorStats> {
        Some(match &self.custom {
            Some(_) => self.custom_counters.snapshot(),
            None => self.heap.stats(),
        })
    }
}

impl fmt::Debug for OsAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsAllocator")
            .field("custom_source", &self.custom.is_some())
            .field("allocated_bytes", &self.num_allocated_bytes())
            .finish()
    }
}
