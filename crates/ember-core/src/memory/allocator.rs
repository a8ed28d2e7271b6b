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

//! Named allocators with a redirectable allocation source.

use super::source::{
    AllocationFlags, AllocationSite, AllocationSource, OutOfMemoryHandler, OutOfMemoryReport,
};
use super::AllocatorStats;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError, RwLock};

/// A named, trackable allocator.
///
/// An `Allocator` forwards every call to its *current* [`AllocationSource`].
/// The source supplied at construction is remembered as the original one and
/// never changes; the current source can be redirected any number of times
/// (e.g. through a profiling source) and [`reset`](Self::reset_allocation_source)
/// restores the original exactly.
///
/// Redirection only changes where *future* allocations go. Blocks handed out
/// before a redirect must be returned while the same source is current, or
/// directly to the source that produced them.
pub struct Allocator {
    name: String,
    description: String,
    original_source: Arc<dyn AllocationSource>,
    source: RwLock<Arc<dyn AllocationSource>>,
    out_of_memory: RwLock<Option<OutOfMemoryHandler>>,
}

impl Allocator {
    /// Creates an allocator served by `source`.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        source: Arc<dyn AllocationSource>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            original_source: source.clone(),
            source: RwLock::new(source),
            out_of_memory: RwLock::new(None),
        }
    }

    /// The allocator's debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A human readable description of what the allocator is used for.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The source currently serving allocations.
    pub fn allocation_source(&self) -> Arc<dyn AllocationSource> {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The source the allocator was created with.
    pub fn original_allocation_source(&self) -> &Arc<dyn AllocationSource> {
        &self.original_source
    }

    /// Redirects all future allocations to `source`.
    pub fn set_allocation_source(&self, source: Arc<dyn AllocationSource>) {
        log::debug!("Allocator '{}' redirected to a new allocation source.", self.name);
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = source;
    }

    /// Restores the original allocation source.
    pub fn reset_allocation_source(&self) {
        log::debug!("Allocator '{}' reset to its original allocation source.", self.name);
        *self.source.write().unwrap_or_else(PoisonError::into_inner) =
            self.original_source.clone();
    }

    /// Returns `true` while a source other than the original one is current.
    pub fn is_redirected(&self) -> bool {
        let current = self.allocation_source();
        !std::ptr::addr_eq(Arc::as_ptr(&current), Arc::as_ptr(&self.original_source))
    }

    /// Installs the hook invoked when an allocation returns null.
    pub fn set_out_of_memory_handler(&self, handler: OutOfMemoryHandler) {
        *self
            .out_of_memory
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn report_out_of_memory(&self, size: usize, alignment: usize, site: AllocationSite) {
        log::error!(
            "Allocator '{}' is out of memory: {size} bytes (alignment {alignment}) requested by {site}",
            self.name
        );
        let handler = self
            .out_of_memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&OutOfMemoryReport {
                allocator: self.name.clone(),
                size,
                alignment,
                site,
            });
        }
    }
}

impl AllocationSource for Allocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        flags: AllocationFlags,
        site: AllocationSite,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let ptr = self.allocation_source().allocate(size, alignment, flags, site);
        if ptr.is_none() {
            self.report_out_of_memory(size, alignment, site);
        }
        ptr
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        self.allocation_source().deallocate(ptr, size, alignment);
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, new_size: usize) -> usize {
        self.allocation_source().resize(ptr, new_size)
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        new_alignment: usize,
    ) -> Option<NonNull<u8>> {
        let result = self
            .allocation_source()
            .reallocate(ptr, new_size, new_alignment);
        if result.is_none() && new_size > 0 {
            self.report_out_of_memory(new_size, new_alignment, AllocationSite::here("reallocate"));
        }
        result
    }

    unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.allocation_source().allocation_size(ptr)
    }

    fn num_allocated_bytes(&self) -> usize {
        self.allocation_source().num_allocated_bytes()
    }

    fn capacity(&self) -> usize {
        self.allocation_source().capacity()
    }

    fn max_allocation_size(&self) -> usize {
        self.allocation_source().max_allocation_size()
    }

    fn garbage_collect(&self) {
        self.allocation_source().garbage_collect();
    }

    fn stats(&self) -> Option<AllocatorStats> {
        self.allocation_source().stats()
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("redirected", &self.is_redirected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A source that never hands out memory but counts how often it was asked.
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl AllocationSource for CountingSource {
        fn allocate(
            &self,
            _size: usize,
            _alignment: usize,
            _flags: AllocationFlags,
            _site: AllocationSite,
        ) -> Option<NonNull<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize, _alignment: usize) {}

        unsafe fn reallocate(
            &self,
            _ptr: Option<NonNull<u8>>,
            _new_size: usize,
            _new_alignment: usize,
        ) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn allocation_size(&self, _ptr: NonNull<u8>) -> usize {
            0
        }

        fn num_allocated_bytes(&self) -> usize {
            0
        }

        fn capacity(&self) -> usize {
            0
        }

        fn max_allocation_size(&self) -> usize {
            0
        }
    }

    fn allocate(allocator: &Allocator) -> Option<NonNull<u8>> {
        allocator.allocate(32, 8, AllocationFlags::NONE, AllocationSite::here("test"))
    }

    #[test]
    fn test_redirect_and_reset_switch_sources() {
        let original = Arc::new(CountingSource::default());
        let redirect = Arc::new(CountingSource::default());
        let allocator = Allocator::new("test", "redirect test", original.clone());

        allocate(&allocator);
        assert_eq!(original.calls.load(Ordering::Relaxed), 1);
        assert!(!allocator.is_redirected());

        allocator.set_allocation_source(redirect.clone());
        assert!(allocator.is_redirected());
        allocate(&allocator);
        allocate(&allocator);
        assert_eq!(original.calls.load(Ordering::Relaxed), 1);
        assert_eq!(redirect.calls.load(Ordering::Relaxed), 2);

        allocator.reset_allocation_source();
        assert!(!allocator.is_redirected());
        allocate(&allocator);
        assert_eq!(original.calls.load(Ordering::Relaxed), 2);
        assert_eq!(redirect.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_reset_without_redirect_is_harmless() {
        let original = Arc::new(CountingSource::default());
        let allocator = Allocator::new("test", "", original.clone());
        allocator.reset_allocation_source();
        allocator.reset_allocation_source();
        assert!(!allocator.is_redirected());
        assert!(std::ptr::addr_eq(
            Arc::as_ptr(allocator.original_allocation_source()),
            Arc::as_ptr(&original)
        ));
    }

    #[test]
    fn test_null_allocation_reports_out_of_memory() {
        let allocator = Allocator::new("oom", "", Arc::new(CountingSource::default()));
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = reports.clone();
        allocator.set_out_of_memory_handler(Arc::new(move |report: &OutOfMemoryReport| {
            assert_eq!(report.allocator, "oom");
            assert_eq!(report.size, 32);
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(allocate(&allocator).is_none());
        assert_eq!(reports.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_zero_sized_allocation_is_not_an_error() {
        let source = Arc::new(CountingSource::default());
        let allocator = Allocator::new("zero", "", source.clone());
        let reports = Arc::new(AtomicUsize::new(0));
        let seen = reports.clone();
        allocator.set_out_of_memory_handler(Arc::new(move |_: &OutOfMemoryReport| {
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(allocator
            .allocate(0, 8, AllocationFlags::NONE, AllocationSite::unknown())
            .is_none());
        assert_eq!(reports.load(Ordering::Relaxed), 0);
        assert_eq!(source.calls.load(Ordering::Relaxed), 0);
    }
}
