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

//! The default scratch-buffer allocator for streaming requests.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use ember_core::io::{MemoryType, Recommendations, RequestMemoryAllocation, RequestMemoryAllocator};
use ember_core::memory::{align_up, AllocationFlags, AllocationSite, AllocationSource};

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    size: usize,
    alignment: usize,
}

/// Hands out request buffers from an [`AllocationSource`].
///
/// Buffer sizes are rounded up to the size alignment of the configured
/// [`Recommendations`]. The allocator keeps count of its users (see
/// [`RequestMemoryAllocator::lock_allocator`]) and, in debug builds, of its
/// outstanding allocations; dropping it while either is non-zero is a
/// programming error and panics in debug builds.
pub struct DefaultRequestMemoryAllocator {
    source: Arc<dyn AllocationSource>,
    recommendations: Recommendations,
    lock_counter: AtomicI32,
    #[cfg(debug_assertions)]
    allocation_counter: AtomicI32,
    live: Mutex<HashMap<usize, LiveBlock>>,
}

impl DefaultRequestMemoryAllocator {
    /// Creates an allocator serving buffers from `source`.
    pub fn new(source: Arc<dyn AllocationSource>, recommendations: Recommendations) -> Self {
        Self {
            source,
            recommendations,
            lock_counter: AtomicI32::new(0),
            #[cfg(debug_assertions)]
            allocation_counter: AtomicI32::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// The alignment policy used to size buffers.
    pub fn recommendations(&self) -> &Recommendations {
        &self.recommendations
    }

    /// The number of users that currently hold the allocator.
    pub fn lock_count(&self) -> i32 {
        self.lock_counter.load(Ordering::Acquire)
    }

    /// The number of buffers that have not been released yet.
    pub fn outstanding_allocations(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl RequestMemoryAllocator for DefaultRequestMemoryAllocator {
    fn lock_allocator(&self) {
        self.lock_counter.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock_allocator(&self) {
        let previous = self.lock_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "request memory allocator unlocked more often than locked");
    }

    fn allocate(
        &self,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocation {
        debug_assert!(
            recommended_size >= minimal_size,
            "recommended size {recommended_size} is smaller than the minimal size {minimal_size}"
        );
        if recommended_size == 0 {
            return RequestMemoryAllocation::empty();
        }

        let Ok(requested) = usize::try_from(recommended_size.max(minimal_size)) else {
            log::error!("Request buffer of {recommended_size} bytes exceeds the address space");
            return RequestMemoryAllocation::empty();
        };
        let size_alignment = self.recommendations.size_alignment() as usize;
        let Some(size) = align_up(requested, size_alignment) else {
            return RequestMemoryAllocation::empty();
        };
        let alignment = alignment.max(1);

        let Some(address) = self.source.allocate(
            size,
            alignment,
            AllocationFlags::NONE,
            AllocationSite::here("request buffer"),
        ) else {
            log::warn!("Failed to allocate a request buffer of {size} bytes");
            return RequestMemoryAllocation::empty();
        };

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.as_ptr() as usize, LiveBlock { size, alignment });
        #[cfg(debug_assertions)]
        self.allocation_counter.fetch_add(1, Ordering::AcqRel);

        RequestMemoryAllocation {
            address: Some(address),
            size,
            memory_type: MemoryType::ReadWrite,
        }
    }

    fn release(&self, address: NonNull<u8>) {
        let block = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(address.as_ptr() as usize));
        debug_assert!(block.is_some(), "released an unknown request buffer");

        let Some(block) = block else {
            log::error!("Released request buffer {address:p} that this allocator does not own");
            return;
        };

        // SAFETY: `address` was handed out by `self.source` with this layout and
        // has just been removed from the live set, so it is released once.
        unsafe { self.source.deallocate(address, block.size, block.alignment) };
        #[cfg(debug_assertions)]
        self.allocation_counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for DefaultRequestMemoryAllocator {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let locks = *self.lock_counter.get_mut();
        if locks != 0 {
            log::error!("Request memory allocator destroyed with {locks} outstanding locks");
        }
        debug_assert_eq!(locks, 0, "request memory allocator destroyed while locked");

        #[cfg(debug_assertions)]
        {
            let allocations = *self.allocation_counter.get_mut();
            assert_eq!(
                allocations, 0,
                "request memory allocator destroyed with outstanding allocations"
            );
        }
        #[cfg(not(debug_assertions))]
        {
            let leaked = self.live.get_mut().map_or(0, |live| live.len());
            if leaked != 0 {
                log::error!("Request memory allocator destroyed with {leaked} outstanding buffers");
            }
        }
    }
}

impl fmt::Debug for DefaultRequestMemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultRequestMemoryAllocator")
            .field("recommendations", &self.recommendations)
            .field("locks", &self.lock_count())
            .field("outstanding", &self.outstanding_allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::OsAllocator;

    fn allocator() -> (Arc<OsAllocator>, DefaultRequestMemoryAllocator) {
        let source = Arc::new(OsAllocator::default());
        let allocator =
            DefaultRequestMemoryAllocator::new(source.clone(), Recommendations::new(4096, 512));
        (source, allocator)
    }

    #[test]
    fn test_rounds_to_size_alignment() {
        let (source, allocator) = allocator();
        let allocation = allocator.allocate(100, 100, 4096);
        let address = allocation.address.unwrap();
        assert_eq!(allocation.size, 512);
        assert_eq!(address.as_ptr() as usize % 4096, 0);
        assert_eq!(source.num_allocated_bytes(), 512);

        allocator.release(address);
        assert_eq!(source.num_allocated_bytes(), 0);
    }

    #[test]
    fn test_zero_recommended_size_is_empty() {
        let (source, allocator) = allocator();
        let allocation = allocator.allocate(0, 0, 16);
        assert!(allocation.address.is_none());
        assert_eq!(allocation.size, 0);
        assert_eq!(source.num_allocated_bytes(), 0);
    }

    #[test]
    fn test_balanced_usage_drops_cleanly() {
        let (source, allocator) = allocator();
        for i in 1..=8u64 {
            allocator.lock_allocator();
            let allocation = allocator.allocate(i * 100, i * 128, 64);
            assert_eq!(allocator.outstanding_allocations(), 1);
            allocator.release(allocation.address.unwrap());
            allocator.unlock_allocator();
        }
        assert_eq!(allocator.lock_count(), 0);
        drop(allocator);
        assert_eq!(source.num_allocated_bytes(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "destroyed while locked")]
    fn test_outstanding_lock_is_detected() {
        let (_source, allocator) = allocator();
        allocator.lock_allocator();
        allocator.lock_allocator();
        allocator.unlock_allocator();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outstanding allocations")]
    fn test_outstanding_allocation_is_detected() {
        let (_source, allocator) = allocator();
        let _ = allocator.allocate(10, 512, 16);
    }
}
