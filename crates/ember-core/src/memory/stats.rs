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

//! Per-allocator accounting.
//!
//! Every schema owns a [`StatsCounters`] block of atomic counters. Anything in
//! the engine can take an [`AllocatorStats`] snapshot of it in a thread-safe
//! manner to monitor memory usage.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The size, in bytes, at or above which an allocation is considered "large".
pub const LARGE_ALLOCATION_THRESHOLD: usize = 1024 * 1024; // 1MB
/// The size, in bytes, below which an allocation is considered "small".
pub const SMALL_ALLOCATION_THRESHOLD: usize = 1024; // 1KB

/// A snapshot of an allocator's counters, including derived metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllocatorStats {
    // --- Current State ---
    /// The total number of bytes currently in use.
    pub current_allocated_bytes: usize,
    /// The maximum number of bytes that were ever in use simultaneously.
    pub peak_allocated_bytes: usize,

    // --- Allocation Counters ---
    /// The total number of times an allocation was served.
    pub total_allocations: u64,
    /// The total number of times a deallocation was served.
    pub total_deallocations: u64,
    /// The total number of times a block was resized or reallocated.
    pub total_reallocations: u64,
    /// The net number of live allocations.
    pub net_allocations: i64,

    // --- Lifetime Totals ---
    /// The cumulative sum of all bytes ever allocated.
    pub bytes_allocated_lifetime: u64,
    /// The cumulative sum of all bytes ever deallocated.
    pub bytes_deallocated_lifetime: u64,

    // --- Size Category Tracking ---
    /// The number of allocations classified as "large".
    pub large_allocations: u64,
    /// The number of allocations classified as "small".
    pub small_allocations: u64,

    // --- Calculated Metrics ---
    /// The average size of a single allocation.
    pub average_allocation_size: f64,
}

impl AllocatorStats {
    /// Populates the derived metrics based on the raw counter values.
    pub fn calculate_derived_metrics(&mut self) {
        self.net_allocations = self.total_allocations as i64 - self.total_deallocations as i64;
        if self.total_allocations > 0 {
            self.average_allocation_size =
                self.bytes_allocated_lifetime as f64 / self.total_allocations as f64;
        }
    }
}

/// Lock-free counters shared by the allocation schemas.
///
/// All updates use `Ordering::Relaxed`: the counters are statistics and never
/// guard memory themselves.
#[derive(Debug, Default)]
pub struct StatsCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    reallocations: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_deallocated: AtomicU64,
    large: AtomicU64,
    small: AtomicU64,
}

impl StatsCounters {
    /// Creates a zeroed set of counters.
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_deallocated: AtomicU64::new(0),
            large: AtomicU64::new(0),
            small: AtomicU64::new(0),
        }
    }

    /// Records a successful allocation of `size` bytes.
    pub fn record_allocation(&self, size: usize) {
        let result = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_add(size)
            });

        match result {
            Ok(previous) => {
                self.peak.fetch_max(previous + size, Ordering::Relaxed);
                self.allocations.fetch_add(1, Ordering::Relaxed);
                self.bytes_allocated
                    .fetch_add(size as u64, Ordering::Relaxed);

                if size >= LARGE_ALLOCATION_THRESHOLD {
                    self.large.fetch_add(1, Ordering::Relaxed);
                } else if size < SMALL_ALLOCATION_THRESHOLD {
                    self.small.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => log::error!("Allocation counter overflowed during alloc! Size: {size}"),
        }
    }

    /// Records that a block of `size` bytes was returned.
    pub fn record_deallocation(&self, size: usize) {
        let result = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(size)
            });

        if result.is_err() {
            log::error!("Allocation counter underflowed during dealloc! Size: {size}");
        } else {
            self.deallocations.fetch_add(1, Ordering::Relaxed);
            self.bytes_deallocated
                .fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    /// Records that a live block changed size from `old_size` to `new_size`.
    pub fn record_reallocation(&self, old_size: usize, new_size: usize) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
        match new_size.cmp(&old_size) {
            std::cmp::Ordering::Greater => {
                let grown = new_size - old_size;
                self.bytes_allocated
                    .fetch_add(grown as u64, Ordering::Relaxed);
                if let Ok(previous) =
                    self.current
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                            current.checked_add(grown)
                        })
                {
                    self.peak.fetch_max(previous + grown, Ordering::Relaxed);
                } else {
                    log::error!("Allocation counter overflowed during realloc! Diff: {grown}");
                }
            }
            std::cmp::Ordering::Less => {
                let freed = old_size - new_size;
                self.bytes_deallocated
                    .fetch_add(freed as u64, Ordering::Relaxed);
                if self
                    .current
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        current.checked_sub(freed)
                    })
                    .is_err()
                {
                    log::error!("Allocation counter underflowed during realloc! Diff: {freed}");
                }
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    /// The number of bytes currently accounted as live.
    pub fn current_bytes(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Takes a snapshot of all counters.
    pub fn snapshot(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            current_allocated_bytes: self.current.load(Ordering::Relaxed),
            peak_allocated_bytes: self.peak.load(Ordering::Relaxed),
            total_allocations: self.allocations.load(Ordering::Relaxed),
            total_deallocations: self.deallocations.load(Ordering::Relaxed),
            total_reallocations: self.reallocations.load(Ordering::Relaxed),
            bytes_allocated_lifetime: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_deallocated_lifetime: self.bytes_deallocated.load(Ordering::Relaxed),
            large_allocations: self.large.load(Ordering::Relaxed),
            small_allocations: self.small.load(Ordering::Relaxed),
            ..Default::default()
        };
        stats.calculate_derived_metrics();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_live_bytes() {
        let counters = StatsCounters::new();
        counters.record_allocation(100);
        counters.record_allocation(2 * LARGE_ALLOCATION_THRESHOLD);
        counters.record_deallocation(100);

        let stats = counters.snapshot();
        assert_eq!(stats.current_allocated_bytes, 2 * LARGE_ALLOCATION_THRESHOLD);
        assert_eq!(stats.peak_allocated_bytes, 2 * LARGE_ALLOCATION_THRESHOLD + 100);
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 1);
        assert_eq!(stats.net_allocations, 1);
        assert_eq!(stats.large_allocations, 1);
        assert_eq!(stats.small_allocations, 1);
    }

    #[test]
    fn test_reallocation_adjusts_current_bytes() {
        let counters = StatsCounters::new();
        counters.record_allocation(64);
        counters.record_reallocation(64, 256);
        assert_eq!(counters.current_bytes(), 256);
        counters.record_reallocation(256, 32);
        assert_eq!(counters.current_bytes(), 32);
        assert_eq!(counters.snapshot().total_reallocations, 2);
        assert_eq!(counters.snapshot().peak_allocated_bytes, 256);
    }

    #[test]
    fn test_underflow_is_rejected() {
        let counters = StatsCounters::new();
        counters.record_deallocation(10);
        let stats = counters.snapshot();
        assert_eq!(stats.current_allocated_bytes, 0);
        assert_eq!(stats.total_deallocations, 0);
    }

    #[test]
    fn test_average_size_is_derived() {
        let counters = StatsCounters::new();
        counters.record_allocation(10);
        counters.record_allocation(30);
        assert_eq!(counters.snapshot().average_allocation_size, 20.0);
    }
}
