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

//! An explicit registry holding one canonical allocator per tag.
//!
//! The [`AllocatorRegistry`] replaces process-wide allocator singletons: the
//! application constructs it at startup, registers its allocators, and passes
//! it (or the allocators it hands out) to the subsystems that need memory.
//!
//! # Design
//!
//! Allocators are keyed by the [`TypeId`] of a zero-sized tag type implementing
//! [`AllocatorTag`], which keeps "one canonical allocator per tag" a
//! compile-time notion without any hidden global state.

use super::Allocator;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Marker trait for allocator tags.
pub trait AllocatorTag: 'static {
    /// The debug name used for the tag's allocator.
    const NAME: &'static str;
}

/// Errors raised by [`AllocatorRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An allocator is already registered for this tag.
    AlreadyRegistered {
        /// The tag's name.
        tag: &'static str,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered { tag } => {
                write!(f, "An allocator is already registered for tag '{tag}'")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A registry of allocators keyed by tag type.
///
/// # Example
///
/// ```rust
/// use ember_core::memory::{AllocatorRegistry, AllocatorTag};
/// # use ember_core::memory::{AllocationFlags, AllocationSite, AllocationSource};
/// # use std::ptr::NonNull;
/// # use std::sync::Arc;
/// # struct Null;
/// # impl AllocationSource for Null {
/// #     fn allocate(&self, _: usize, _: usize, _: AllocationFlags, _: AllocationSite) -> Option<NonNull<u8>> { None }
/// #     unsafe fn deallocate(&self, _: NonNull<u8>, _: usize, _: usize) {}
/// #     unsafe fn reallocate(&self, _: Option<NonNull<u8>>, _: usize, _: usize) -> Option<NonNull<u8>> { None }
/// #     unsafe fn allocation_size(&self, _: NonNull<u8>) -> usize { 0 }
/// #     fn num_allocated_bytes(&self) -> usize { 0 }
/// #     fn capacity(&self) -> usize { 0 }
/// #     fn max_allocation_size(&self) -> usize { 0 }
/// # }
///
/// struct StreamingMemory;
/// impl AllocatorTag for StreamingMemory {
///     const NAME: &'static str = "streaming";
/// }
///
/// let mut registry = AllocatorRegistry::new();
/// registry
///     .register::<StreamingMemory>(Arc::new(Null), "I/O buffers")
///     .unwrap();
///
/// let allocator = registry.get::<StreamingMemory>().unwrap();
/// assert_eq!(allocator.name(), "streaming");
/// ```
#[derive(Default)]
pub struct AllocatorRegistry {
    allocators: HashMap<TypeId, Arc<Allocator>>,
}

impl AllocatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocators: HashMap::new(),
        }
    }

    /// Creates and registers the canonical allocator for tag `T`.
    ///
    /// Each tag can only be registered once.
    pub fn register<T: AllocatorTag>(
        &mut self,
        source: Arc<dyn super::AllocationSource>,
        description: impl Into<String>,
    ) -> Result<Arc<Allocator>, RegistryError> {
        if self.allocators.contains_key(&TypeId::of::<T>()) {
            return Err(RegistryError::AlreadyRegistered { tag: T::NAME });
        }
        let allocator = Arc::new(Allocator::new(T::NAME, description, source));
        self.allocators.insert(TypeId::of::<T>(), allocator.clone());
        log::info!("Registered allocator '{}'.", T::NAME);
        Ok(allocator)
    }

    /// Retrieves the allocator registered for tag `T`.
    #[must_use]
    pub fn get<T: AllocatorTag>(&self) -> Option<Arc<Allocator>> {
        self.allocators.get(&TypeId::of::<T>()).cloned()
    }

    /// Removes the allocator registered for tag `T`.
    pub fn unregister<T: AllocatorTag>(&mut self) -> Option<Arc<Allocator>> {
        self.allocators.remove(&TypeId::of::<T>())
    }

    /// Returns `true` if an allocator is registered for tag `T`.
    #[must_use]
    pub fn contains<T: AllocatorTag>(&self) -> bool {
        self.allocators.contains_key(&TypeId::of::<T>())
    }

    /// Iterates over all registered allocators, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Allocator>> {
        self.allocators.values()
    }

    /// Returns the number of registered allocators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocators.len()
    }

    /// Returns `true` if no allocators are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocators.is_empty()
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.allocators.values()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationFlags, AllocationSite, AllocationSource};
    use std::ptr::NonNull;

    struct NullSource;

    impl AllocationSource for NullSource {
        fn allocate(
            &self,
            _size: usize,
            _alignment: usize,
            _flags: AllocationFlags,
            _site: AllocationSite,
        ) -> Option<NonNull<u8>> {
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

    struct SystemTag;
    impl AllocatorTag for SystemTag {
        const NAME: &'static str = "system";
    }

    struct StreamingTag;
    impl AllocatorTag for StreamingTag {
        const NAME: &'static str = "streaming";
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = AllocatorRegistry::new();
        registry
            .register::<SystemTag>(Arc::new(NullSource), "general purpose")
            .unwrap();

        let allocator = registry.get::<SystemTag>().unwrap();
        assert_eq!(allocator.name(), "system");
        assert_eq!(allocator.description(), "general purpose");
    }

    #[test]
    fn test_get_missing_returns_none() {
        let registry = AllocatorRegistry::new();
        assert!(registry.get::<SystemTag>().is_none());
    }

    #[test]
    fn test_one_allocator_per_tag() {
        let mut registry = AllocatorRegistry::new();
        let first = registry
            .register::<SystemTag>(Arc::new(NullSource), "")
            .unwrap();
        let second = registry.register::<SystemTag>(Arc::new(NullSource), "");
        assert_eq!(
            second.unwrap_err(),
            RegistryError::AlreadyRegistered { tag: "system" }
        );
        assert!(Arc::ptr_eq(&first, &registry.get::<SystemTag>().unwrap()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_multiple_tags() {
        let mut registry = AllocatorRegistry::new();
        registry
            .register::<SystemTag>(Arc::new(NullSource), "")
            .unwrap();
        registry
            .register::<StreamingTag>(Arc::new(NullSource), "")
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains::<SystemTag>());
        assert!(registry.contains::<StreamingTag>());

        assert!(registry.unregister::<SystemTag>().is_some());
        assert!(!registry.contains::<SystemTag>());
        assert_eq!(registry.iter().count(), 1);
    }

    #[test]
    fn test_default_is_empty() {
        let registry = AllocatorRegistry::default();
        assert!(registry.is_empty());
    }
}
