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

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_core::io::{AllocatedBuffer, Recommendations, RequestMemoryAllocator};
use ember_core::memory::{
    AllocationFlags, AllocationSite, AllocationSource, AllocatorRegistry, AllocatorTag,
    OutOfMemoryReport,
};
use ember_data::allocators::{
    DefaultRequestMemoryAllocator, MallocSchema, OsAllocator, OsAllocatorDescriptor,
    TrackingSource,
};

struct StreamingMemory;
impl AllocatorTag for StreamingMemory {
    const NAME: &'static str = "streaming";
}

/// Small deterministic generator so the sequences are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn test_os_allocator_counts_exactly_the_outstanding_bytes() {
    let os = OsAllocator::default();
    let mut rng = Lcg(7);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.next() % 3 != 0 {
            let size = (rng.next() % 4096 + 1) as usize;
            let ptr = os
                .allocate(size, 16, AllocationFlags::NONE, AllocationSite::here("seq"))
                .expect("system allocator exhausted");
            live.push((ptr, size));
        } else {
            let index = (rng.next() as usize) % live.len();
            let (ptr, size) = live.swap_remove(index);
            unsafe { os.deallocate(ptr, size, 16) };
        }

        let expected: usize = live.iter().map(|(_, size)| size).sum();
        assert_eq!(os.num_allocated_bytes(), expected);
    }

    for (ptr, size) in live.drain(..) {
        unsafe { os.deallocate(ptr, size, 16) };
    }
    assert_eq!(os.num_allocated_bytes(), 0);
}

#[test]
fn test_registry_allocator_can_be_profiled_and_restored() {
    let mut registry = AllocatorRegistry::new();
    let allocator = registry
        .register::<StreamingMemory>(Arc::new(MallocSchema::new()), "stream buffers")
        .unwrap();

    let tracking = Arc::new(TrackingSource::new(
        allocator.original_allocation_source().clone(),
    ));
    allocator.set_allocation_source(tracking.clone());
    assert!(allocator.is_redirected());

    let request_allocator: Arc<dyn RequestMemoryAllocator> = Arc::new(
        DefaultRequestMemoryAllocator::new(allocator.clone(), Recommendations::default()),
    );
    {
        let mut buffer =
            AllocatedBuffer::allocate(request_allocator.clone(), 100, 600, 4096).unwrap();
        assert_eq!(buffer.len(), 1024);
        buffer.as_mut_slice()[..3].copy_from_slice(b"abc");
        assert_eq!(&buffer.as_slice()[..3], b"abc");
    }

    allocator.reset_allocation_source();
    assert!(!allocator.is_redirected());

    let stats = tracking.stats().unwrap();
    assert_eq!(stats.total_allocations, 1);
    assert_eq!(stats.total_deallocations, 1);
    assert_eq!(stats.peak_allocated_bytes, 1024);
    assert_eq!(allocator.num_allocated_bytes(), 0);
}

#[test]
fn test_exhaustion_reaches_the_out_of_memory_handler() {
    let mut registry = AllocatorRegistry::new();
    let bounded = OsAllocator::create(OsAllocatorDescriptor {
        custom_source: None,
        capacity: 4096,
    });
    let allocator = registry
        .register::<StreamingMemory>(Arc::new(bounded), "bounded")
        .unwrap();

    let reports = Arc::new(AtomicUsize::new(0));
    let counter = reports.clone();
    allocator.set_out_of_memory_handler(Arc::new(move |report: &OutOfMemoryReport| {
        assert_eq!(report.allocator, "streaming");
        assert_eq!(report.size, 8192);
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let request_allocator =
        DefaultRequestMemoryAllocator::new(allocator.clone(), Recommendations::default());
    let allocation = request_allocator.allocate(8192, 8192, 4096);
    assert!(allocation.address.is_none());
    assert_eq!(reports.load(Ordering::SeqCst), 1);
}
