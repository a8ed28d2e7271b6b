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

//! Types shared between the streamer, its stages, and its callers.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Number of samples kept by the rolling statistics of the streaming stages.
pub const STATISTICS_WINDOW_SIZE: usize = 128;

/// The lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    /// Submitted but not yet prepared or queued.
    Pending,
    /// Handed to the stream stack for execution.
    Queued,
    /// A stage is working on the request.
    Processing,
    /// The request finished successfully.
    Completed,
    /// The request could not be served.
    Failed,
}

impl RequestStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Converts back from the `u8` representation.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Queued,
            2 => RequestStatus::Processing,
            3 => RequestStatus::Completed,
            _ => RequestStatus::Failed,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "Pending"),
            RequestStatus::Queued => write!(f, "Queued"),
            RequestStatus::Processing => write!(f, "Processing"),
            RequestStatus::Completed => write!(f, "Completed"),
            RequestStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Alignment policy for I/O buffers.
///
/// Device reads are most efficient when the destination address is aligned to
/// `memory_alignment` and the read size is a multiple of `size_alignment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendations {
    memory_alignment: usize,
    size_alignment: u64,
}

impl Recommendations {
    /// Creates a policy. Both alignments must be non-zero powers of two.
    pub fn new(memory_alignment: usize, size_alignment: u64) -> Self {
        assert!(
            memory_alignment.is_power_of_two(),
            "memory alignment must be a power of two"
        );
        assert!(
            size_alignment.is_power_of_two(),
            "size alignment must be a power of two"
        );
        Self {
            memory_alignment,
            size_alignment,
        }
    }

    /// The recommended alignment for buffer addresses.
    pub fn memory_alignment(&self) -> usize {
        self.memory_alignment
    }

    /// The granularity buffer sizes should be rounded to.
    pub fn size_alignment(&self) -> u64 {
        self.size_alignment
    }

    /// The buffer size to allocate for a read of `read_size` bytes at
    /// `read_offset`.
    ///
    /// The result covers the distance between `read_offset` and the aligned
    /// offset below it, so a misaligned read still fits, and it is always a
    /// multiple of the size alignment.
    ///
    /// The result is at least `read_size` only while `read_size` is below
    /// `u64::MAX - 2 * size_alignment`. Above that the sum saturates at the
    /// largest aligned value, which is smaller than `read_size`; reads that
    /// large cannot be buffered anyway.
    pub fn calculate_recommended_memory_size(&self, read_size: u64, read_offset: u64) -> u64 {
        let mask = self.size_alignment - 1;
        let offset_adjustment = read_offset - (read_offset & !mask);
        read_size
            .saturating_add(offset_adjustment)
            .saturating_add(mask)
            & !mask
    }
}

impl Default for Recommendations {
    fn default() -> Self {
        Self::new(4096, 512)
    }
}

/// How the memory handed out by a [`RequestMemoryAllocator`] may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    /// The caller may only read from the buffer.
    ReadOnly,
    /// The caller may read from and write to the buffer.
    #[default]
    ReadWrite,
}

/// A block handed out by a [`RequestMemoryAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestMemoryAllocation {
    /// Start of the block, `None` when no buffer was needed or available.
    pub address: Option<NonNull<u8>>,
    /// Usable size of the block.
    pub size: usize,
    /// What the block may be used for.
    pub memory_type: MemoryType,
}

// SAFETY: the allocation only describes a block; access to the memory itself
// goes through `AllocatedBuffer`, which owns it exclusively.
unsafe impl Send for RequestMemoryAllocation {}
unsafe impl Sync for RequestMemoryAllocation {}

impl RequestMemoryAllocation {
    /// The "no buffer" result.
    pub const fn empty() -> Self {
        Self {
            address: None,
            size: 0,
            memory_type: MemoryType::ReadWrite,
        }
    }
}

/// Hands out scratch buffers for I/O requests.
///
/// `lock_allocator`/`unlock_allocator` let long-lived users (e.g. a request
/// still in flight) assert that the allocator must stay alive without taking
/// ownership of it. Every [`allocate`](Self::allocate) that returns an address
/// must be paired with exactly one [`release`](Self::release).
pub trait RequestMemoryAllocator: Send + Sync {
    /// Registers a user of the allocator.
    fn lock_allocator(&self);

    /// Unregisters a user of the allocator.
    fn unlock_allocator(&self);

    /// Allocates a buffer of at least `minimal_size` bytes; `recommended_size`
    /// (which must be `>= minimal_size`) is the size the caller would prefer.
    /// A `recommended_size` of 0 returns an empty allocation.
    fn allocate(
        &self,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocation;

    /// Returns a buffer previously handed out by [`allocate`](Self::allocate).
    ///
    /// Releasing the same address twice is a caller error.
    fn release(&self, address: NonNull<u8>);
}

/// A buffer obtained from a [`RequestMemoryAllocator`] that is released when dropped.
pub struct AllocatedBuffer {
    allocation: RequestMemoryAllocation,
    allocator: Arc<dyn RequestMemoryAllocator>,
}

// SAFETY: the buffer exclusively owns its block until it is dropped.
unsafe impl Send for AllocatedBuffer {}
unsafe impl Sync for AllocatedBuffer {}

impl AllocatedBuffer {
    /// Allocates through `allocator`.
    ///
    /// Returns `None` when a non-empty buffer was requested but the allocator
    /// could not provide one.
    pub fn allocate(
        allocator: Arc<dyn RequestMemoryAllocator>,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> Option<Self> {
        let allocation = allocator.allocate(minimal_size, recommended_size, alignment);
        if allocation.address.is_none() && recommended_size.max(minimal_size) > 0 {
            return None;
        }
        Some(Self {
            allocation,
            allocator,
        })
    }

    /// The allocation backing this buffer.
    pub fn allocation(&self) -> &RequestMemoryAllocation {
        &self.allocation
    }

    /// The usable size of the buffer.
    pub fn len(&self) -> usize {
        self.allocation.size
    }

    /// Returns `true` if the buffer has no usable bytes.
    pub fn is_empty(&self) -> bool {
        self.allocation.size == 0
    }

    /// The buffer's contents.
    pub fn as_slice(&self) -> &[u8] {
        match self.allocation.address {
            // SAFETY: the block is live and `size` bytes long until `self` is dropped.
            Some(address) => unsafe {
                std::slice::from_raw_parts(address.as_ptr(), self.allocation.size)
            },
            None => &[],
        }
    }

    /// The buffer's contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.allocation.address {
            // SAFETY: as above, and `&mut self` guarantees exclusive access.
            Some(address) => unsafe {
                std::slice::from_raw_parts_mut(address.as_ptr(), self.allocation.size)
            },
            None => &mut [],
        }
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        if let Some(address) = self.allocation.address.take() {
            self.allocator.release(address);
        }
    }
}

impl fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("allocation", &self.allocation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_size_covers_misaligned_reads() {
        let recommendations = Recommendations::new(4096, 512);
        assert_eq!(recommendations.calculate_recommended_memory_size(100, 10), 512);
        assert_eq!(recommendations.calculate_recommended_memory_size(512, 0), 512);
        assert_eq!(recommendations.calculate_recommended_memory_size(512, 1), 1024);
        assert_eq!(recommendations.calculate_recommended_memory_size(0, 0), 0);
        assert_eq!(recommendations.calculate_recommended_memory_size(1, 1023), 512);
        assert_eq!(recommendations.calculate_recommended_memory_size(2, 511), 1024);
        assert_eq!(recommendations.calculate_recommended_memory_size(513, 1023), 1024);
    }

    #[test]
    fn test_recommended_size_saturates_near_the_limit() {
        let recommendations = Recommendations::new(4096, 512);
        let largest = u64::MAX & !511;
        assert_eq!(
            recommendations.calculate_recommended_memory_size(u64::MAX - 1024, 0),
            u64::MAX - 1023
        );
        assert_eq!(
            recommendations.calculate_recommended_memory_size(u64::MAX - 100, 0),
            largest
        );
        assert_eq!(
            recommendations.calculate_recommended_memory_size(u64::MAX, 1),
            largest
        );
    }

    #[test]
    fn test_recommended_size_is_monotonic_and_aligned() {
        let recommendations = Recommendations::new(16, 64);
        for read_size in (0..2000u64).step_by(37) {
            for read_offset in (0..700u64).step_by(13) {
                let size = recommendations.calculate_recommended_memory_size(read_size, read_offset);
                assert!(size >= read_size);
                assert_eq!(size % 64, 0);
                assert!(size >= read_size + read_offset % 64);
            }
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::Queued.is_terminal());
        for status in [
            RequestStatus::Pending,
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two_alignment() {
        let _ = Recommendations::new(4096, 500);
    }
}
