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

//! The raw allocation contract every schema implements.

use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Returns `None` on overflow.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Hints passed along with an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocationFlags(u32);

impl AllocationFlags {
    /// No special behavior.
    pub const NONE: Self = Self(0);
    /// The memory must be zero-filled before it is handed out.
    pub const ZEROED: Self = Self(1 << 0);
    /// The allocation is expected to outlive the current frame/request.
    pub const PERSISTENT: Self = Self(1 << 1);

    /// Returns the raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if all bits of `other` are set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AllocationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Identifies where an allocation was requested from. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSite {
    /// A short debug name for the allocation.
    pub name: &'static str,
    /// The source file of the caller.
    pub file: &'static str,
    /// The source line of the caller.
    pub line: u32,
}

impl AllocationSite {
    /// Captures the caller's location under the given debug name.
    #[track_caller]
    pub fn here(name: &'static str) -> Self {
        let location = Location::caller();
        Self {
            name,
            file: location.file(),
            line: location.line(),
        }
    }

    /// A site with no information attached.
    pub const fn unknown() -> Self {
        Self {
            name: "",
            file: "",
            line: 0,
        }
    }
}

impl fmt::Display for AllocationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "'{}'", self.name)
        } else {
            write!(f, "'{}' ({}:{})", self.name, self.file, self.line)
        }
    }
}

/// Details handed to an [`OutOfMemoryHandler`] when a source returns null.
#[derive(Debug, Clone)]
pub struct OutOfMemoryReport {
    /// Name of the allocator that failed.
    pub allocator: String,
    /// The number of bytes requested.
    pub size: usize,
    /// The requested alignment.
    pub alignment: usize,
    /// Where the allocation was requested.
    pub site: AllocationSite,
}

/// A pluggable hook invoked when an allocation cannot be satisfied.
///
/// The hook only observes the failure: the allocation call still returns `None`.
pub type OutOfMemoryHandler = Arc<dyn Fn(&OutOfMemoryReport) + Send + Sync>;

/// The raw allocate/deallocate/resize contract.
///
/// Implementations must be safe to call concurrently from any thread. A source
/// returns `None` only when its backing memory is exhausted (or for zero-sized
/// requests); it never panics on exhaustion.
pub trait AllocationSource: Send + Sync {
    /// Allocates `size` bytes aligned to `alignment` (a power of two).
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
        site: AllocationSite,
    ) -> Option<NonNull<u8>>;

    /// Returns a block to the source.
    ///
    /// `size` and `alignment` must match the values the block was allocated
    /// with. Sources that record block sizes validate `size` and report a
    /// mismatch (including a zero size for a non-empty block) as a caller error.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a previous call to [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this same source and must not have
    /// been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize);

    /// Attempts to resize a block in place and returns the size it now has.
    ///
    /// When the block cannot change in place, the current size is returned.
    ///
    /// # Safety
    ///
    /// Same requirements as [`deallocate`](Self::deallocate).
    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        let _ = new_size;
        self.allocation_size(ptr)
    }

    /// Moves a block to a new allocation of `new_size` bytes, copying the
    /// overlapping prefix. A `None` input behaves like [`allocate`](Self::allocate).
    ///
    /// On failure the original block is left untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// When `ptr` is `Some`, the requirements of [`deallocate`](Self::deallocate) apply.
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>>;

    /// Returns the usable size of a block handed out by this source.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block from this source.
    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize;

    /// The number of bytes currently handed out.
    fn num_allocated_bytes(&self) -> usize;

    /// The total number of bytes this source can hand out.
    fn capacity(&self) -> usize;

    /// The largest single allocation this source can satisfy.
    fn max_allocation_size(&self) -> usize;

    /// Gives the source a chance to return cached memory to its parent.
    fn garbage_collect(&self) {}

    /// A snapshot of this source's accounting, if it keeps one.
    fn stats(&self) -> Option<super::AllocatorStats> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 512), Some(512));
        assert_eq!(align_up(usize::MAX, 16), None);
    }

    #[test]
    fn test_flags_combine() {
        let flags = AllocationFlags::ZEROED | AllocationFlags::PERSISTENT;
        assert!(flags.contains(AllocationFlags::ZEROED));
        assert!(flags.contains(AllocationFlags::PERSISTENT));
        assert!(!AllocationFlags::NONE.contains(AllocationFlags::ZEROED));
    }

    #[test]
    fn test_allocation_site_captures_caller() {
        let site = AllocationSite::here("buffer");
        assert_eq!(site.name, "buffer");
        assert!(site.file.ends_with("source.rs"));
        assert!(site.line > 0);
    }
}
