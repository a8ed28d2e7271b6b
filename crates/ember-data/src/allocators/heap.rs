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

//! Header-prefixed blocks on top of a `GlobalAlloc` backend.
//!
//! Every block handed out carries a [`BlockHeader`] directly in front of the
//! user pointer, so a deallocation can be validated against the size the block
//! was allocated with and `allocation_size` needs no side table.

use std::alloc::{GlobalAlloc, Layout};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use ember_core::memory::{align_up, AllocationFlags, AllocatorStats, StatsCounters};

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHeader {
    /// Distance from the start of the backing allocation to the user pointer.
    offset: usize,
    /// Size requested by the caller (or set by an in-place resize).
    size: usize,
    /// Usable bytes behind the user pointer.
    capacity: usize,
    /// Alignment of the backing allocation.
    alignment: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A byte-counting heap whose blocks remember their own layout.
pub(crate) struct HeaderedHeap<A> {
    backend: A,
    counters: StatsCounters,
    capacity: usize,
}

impl<A: GlobalAlloc> HeaderedHeap<A> {
    pub(crate) const fn new(backend: A, capacity: usize) -> Self {
        Self {
            backend,
            counters: StatsCounters::new(),
            capacity,
        }
    }

    fn layout_for(size: usize, alignment: usize) -> Option<(Layout, usize)> {
        let alignment = alignment.max(align_of::<BlockHeader>());
        let offset = align_up(HEADER_SIZE, alignment)?;
        let total = offset.checked_add(size)?;
        let layout = Layout::from_size_align(total, alignment).ok()?;
        Some((layout, offset))
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    unsafe fn header_ptr(ptr: NonNull<u8>) -> *mut BlockHeader {
        ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>()
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    unsafe fn header(ptr: NonNull<u8>) -> BlockHeader {
        Self::header_ptr(ptr).read()
    }

    fn fits(&self, released: usize, requested: usize) -> bool {
        self.counters
            .current_bytes()
            .saturating_sub(released)
            .checked_add(requested)
            .is_some_and(|total| total <= self.capacity)
    }

    fn allocate_raw(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
    ) -> Option<NonNull<u8>> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let (layout, offset) = Self::layout_for(size, alignment)?;

        // SAFETY: `layout` always has a non-zero size.
        let base = unsafe {
            if flags.contains(AllocationFlags::ZEROED) {
                self.backend.alloc_zeroed(layout)
            } else {
                self.backend.alloc(layout)
            }
        };
        let base = NonNull::new(base)?;

        // SAFETY: `offset + size == layout.size()`, so the user pointer and the
        // header in front of it are inside the allocation, and the header slot
        // is aligned because `offset` is a multiple of the header alignment.
        unsafe {
            let user = NonNull::new_unchecked(base.as_ptr().add(offset));
            Self::header_ptr(user).write(BlockHeader {
                offset,
                size,
                capacity: size,
                alignment: layout.align(),
            });
            Some(user)
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap described by `header`.
    unsafe fn free_raw(&self, ptr: NonNull<u8>, header: BlockHeader) {
        let base = ptr.as_ptr().sub(header.offset);
        let layout =
            Layout::from_size_align_unchecked(header.offset + header.capacity, header.alignment);
        self.backend.dealloc(base, layout);
    }

    pub(crate) fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
    ) -> Option<NonNull<u8>> {
        if !self.fits(0, size) {
            return None;
        }
        let ptr = self.allocate_raw(size, alignment, flags)?;
        self.counters.record_allocation(size);
        Some(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub(crate) unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let header = Self::header(ptr);
        if size != header.size {
            log::error!(
                "Deallocating {size} bytes from a block of {} bytes at {ptr:p}",
                header.size
            );
        }
        debug_assert_eq!(size, header.size, "deallocation size mismatch");

        self.free_raw(ptr, header);
        self.counters.record_deallocation(header.size);
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub(crate) unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        let header_ptr = Self::header_ptr(ptr);
        let header = header_ptr.read();
        if new_size == 0 || new_size > header.capacity {
            return header.size;
        }
        (*header_ptr).size = new_size;
        self.counters.record_reallocation(header.size, new_size);
        new_size
    }

    /// # Safety
    ///
    /// When `ptr` is `Some`, it must be a live block of this heap.
    pub(crate) unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, new_alignment, AllocationFlags::NONE);
        };
        let header = Self::header(ptr);
        if new_size == 0 {
            self.free_raw(ptr, header);
            self.counters.record_deallocation(header.size);
            return None;
        }
        if !self.fits(header.size, new_size) {
            return None;
        }

        let new_ptr = self.allocate_raw(new_size, new_alignment, AllocationFlags::NONE)?;
        std::ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            header.size.min(new_size),
        );
        self.free_raw(ptr, header);
        self.counters.record_reallocation(header.size, new_size);
        Some(new_ptr)
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub(crate) unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        Self::header(ptr).size
    }

    pub(crate) fn num_allocated_bytes(&self) -> usize {
        self.counters.current_bytes()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn max_allocation_size(&self) -> usize {
        self.capacity.min(isize::MAX as usize - HEADER_SIZE)
    }

    pub(crate) fn stats(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}
