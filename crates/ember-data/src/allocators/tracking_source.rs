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

//! An allocation source that records statistics for another source.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use ember_core::memory::{
    AllocationFlags, AllocationSite, AllocationSource, AllocatorStats, StatsCounters,
};

/// A wrapper around an [`AllocationSource`] that intercepts every call to
/// update its own [`StatsCounters`].
///
/// This is the usual redirect target when profiling an allocator without code
/// changes:
///
/// ```rust
/// use std::sync::Arc;
/// use ember_core::memory::Allocator;
/// use ember_data::allocators::{MallocSchema, TrackingSource};
///
/// let allocator = Allocator::new("assets", "asset memory", Arc::new(MallocSchema::new()));
/// let tracking = Arc::new(TrackingSource::new(allocator.original_allocation_source().clone()));
/// allocator.set_allocation_source(tracking.clone());
/// // ... run the workload, then inspect `tracking.stats()`.
/// allocator.reset_allocation_source();
/// ```
pub struct TrackingSource {
    inner: Arc<dyn AllocationSource>,
    counters: StatsCounters,
}

impl TrackingSource {
    /// Creates a tracking source that wraps `inner`.
    pub fn new(inner: Arc<dyn AllocationSource>) -> Self {
        Self {
            inner,
            counters: StatsCounters::new(),
        }
    }

    /// The wrapped source.
    pub fn inner(&self) -> &Arc<dyn AllocationSource> {
        &self.inner
    }
}

impl AllocationSource for TrackingSource {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
        site: AllocationSite,
    ) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocate(size, alignment, flags, site);
        match ptr {
            Some(_) => {
                log::trace!("{site}: allocated {size} bytes");
                self.counters.record_allocation(size);
            }
            None => log::trace!("{site}: allocation of {size} bytes failed"),
        }
        ptr
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.inner.deallocate(ptr, size, alignment);
        self.counters.record_deallocation(size);
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        let old_size = self.inner.allocation_size(ptr);
        let size = self.inner.resize(ptr, new_size);
        if size != old_size {
            self.counters.record_reallocation(old_size, size);
        }
        size
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        let old_size = ptr.map_or(0, |ptr| self.inner.allocation_size(ptr));
        let result = self.inner.reallocate(ptr, new_size, new_alignment);
        match (ptr.is_some(), result.is_some()) {
            (false, true) => self.counters.record_allocation(new_size),
            (true, true) => self.counters.record_reallocation(old_size, new_size),
            (true, false) if new_size == 0 => self.counters.record_deallocation(old_size),
            _ => {}
        }
        result
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.inner.allocation_size(ptr)
    }

    fn num_allocated_bytes(&self) -> usize {
        self.inner.num_allocated_bytes()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn max_allocation_size(&self) -> usize {
        self.inner.max_allocation_size()
    }

    fn garbage_collect(&self) {
        self.inner.garbage_collect();
    }

    fn stats(&self) -> Option<AllocatorStats> {
        Some(self.counters.snapshot())
    }
}

impl fmt::Debug for TrackingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingSource")
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::OsAllocator;
    use ember_core::memory::Allocator;

    #[test]
    fn test_redirect_records_only_while_active() {
        let allocator = Allocator::new("test", "tracking test", Arc::new(OsAllocator::default()));
        let tracking = Arc::new(TrackingSource::new(
            allocator.original_allocation_source().clone(),
        ));

        let before = allocator
            .allocate(10, 8, AllocationFlags::NONE, AllocationSite::here("before"))
            .unwrap();

        allocator.set_allocation_source(tracking.clone());
        let during = allocator
            .allocate(1000, 8, AllocationFlags::NONE, AllocationSite::here("during"))
            .unwrap();
        unsafe { allocator.deallocate(during, 1000, 8) };
        allocator.reset_allocation_source();

        unsafe { allocator.deallocate(before, 10, 8) };

        let stats = tracking.stats().unwrap();
        assert_eq!(stats.total_allocations, 1);
        assert_eq!(stats.total_deallocations, 1);
        assert_eq!(stats.peak_allocated_bytes, 1000);
        assert_eq!(stats.current_allocated_bytes, 0);
        assert_eq!(allocator.num_allocated_bytes(), 0);
    }

    #[test]
    fn test_resize_and_reallocate_are_counted() {
        let tracking = TrackingSource::new(Arc::new(OsAllocator::default()));
        let ptr = tracking
            .allocate(512, 8, AllocationFlags::NONE, AllocationSite::unknown())
            .unwrap();
        unsafe {
            assert_eq!(tracking.resize(ptr, 256), 256);
            let ptr = tracking.reallocate(Some(ptr), 2048, 8).unwrap();
            tracking.deallocate(ptr, 2048, 8);
        }

        let stats = tracking.stats().unwrap();
        assert_eq!(stats.total_reallocations, 2);
        assert_eq!(stats.current_allocated_bytes, 0);
        assert_eq!(stats.peak_allocated_bytes, 2048);
    }
}
