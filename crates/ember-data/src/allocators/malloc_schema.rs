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

//! The allocation schema backed by the process heap.

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use ember_core::memory::{AllocationFlags, AllocationSite, AllocationSource, AllocatorStats};

use super::heap::HeaderedHeap;

/// Forwards to whatever `#[global_allocator]` the process installed.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ProcessHeap;

unsafe impl GlobalAlloc for ProcessHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        std::alloc::alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        std::alloc::alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        std::alloc::dealloc(ptr, layout)
    }
}

/// Allocates from the process heap, keeping an atomic byte count.
///
/// Unlike [`OsAllocator`](super::OsAllocator), allocations go through the
/// process's global allocator, so a tracking `#[global_allocator]` sees them.
pub struct MallocSchema {
    heap: HeaderedHeap<ProcessHeap>,
}

impl MallocSchema {
    /// Creates an unbounded schema.
    pub const fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Creates a schema that refuses to hand out more than `capacity` bytes at once.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: HeaderedHeap::new(ProcessHeap, capacity),
        }
    }
}

impl Default for MallocSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationSource for MallocSchema {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
        _site: AllocationSite,
    ) -> Option<NonNull<u8>> {
        self.heap.allocate(size, alignment, flags)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        self.heap.deallocate(ptr, size)
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        self.heap.resize(ptr, new_size)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        self.heap.reallocate(ptr, new_size, new_alignment)
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.heap.allocation_size(ptr)
    }

    fn num_allocated_bytes(&self) -> usize {
        self.heap.num_allocated_bytes()
    }

    fn capacity(&self) -> usize {
        self.heap.capacity()
    }

    fn max_allocation_size(&self) -> usize {
        self.heap.max_allocation_size()
    }

    fn stats(&self) -> Option<AllocatorStats> {
        Some(self.heap.stats())
    }
}

impl fmt::Debug for MallocSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocSchema")
            .field("allocated_bytes", &self.num_allocated_bytes())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_allocations_balance() {
        let schema = Arc::new(MallocSchema::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let schema = schema.clone();
                thread::spawn(move || {
                    for i in 1..=200usize {
                        let size = (i * (t + 1)) % 512 + 1;
                        let ptr = schema
                            .allocate(size, 16, AllocationFlags::NONE, AllocationSite::unknown())
                            .unwrap();
                        unsafe { schema.deallocate(ptr, size, 16) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(schema.num_allocated_bytes(), 0);
        let stats = schema.stats().unwrap();
        assert_eq!(stats.total_allocations, 800);
        assert_eq!(stats.total_deallocations, 800);
    }

    #[test]
    fn test_reallocate_from_none_allocates() {
        let schema = MallocSchema::with_capacity(4096);
        let ptr = unsafe { schema.reallocate(None, 32, 8) }.unwrap();
        assert_eq!(schema.num_allocated_bytes(), 32);
        assert!(unsafe { schema.reallocate(Some(ptr), 0, 8) }.is_none());
        assert_eq!(schema.num_allocated_bytes(), 0);
    }
}
