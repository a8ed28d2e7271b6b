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

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use ember_core::io::STATISTICS_WINDOW_SIZE;

/// One named measurement reported by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    /// The stage that reported it.
    pub owner: String,
    pub name: String,
    pub value: f64,
}

impl Statistic {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} = {:.3}", self.owner, self.name, self.value)
    }
}

/// Moving average over the most recent samples.
#[derive(Debug, Clone)]
pub struct AverageWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl Default for AverageWindow {
    fn default() -> Self {
        Self::new(STATISTICS_WINDOW_SIZE)
    }
}

impl AverageWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Adds a sample, evicting the oldest one when the window is full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// The mean of the samples in the window, 0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Pushes the milliseconds between its creation and its drop into a window.
pub struct ScopedTimer<'a> {
    window: &'a mut AverageWindow,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(window: &'a mut AverageWindow) -> Self {
        Self {
            window,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.window
            .push(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_the_most_recent_samples() {
        let mut window = AverageWindow::new(4);
        assert_eq!(window.average(), 0.0);
        for sample in 1..=6 {
            window.push(sample as f64);
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.average(), 4.5);
        assert_eq!(window.last(), Some(6.0));
    }

    #[test]
    fn test_scoped_timer_records_on_drop() {
        let mut window = AverageWindow::default();
        {
            let _timer = ScopedTimer::new(&mut window);
        }
        assert_eq!(window.len(), 1);
        assert!(window.average() >= 0.0);
    }

    #[test]
    fn test_statistic_display() {
        let statistic = Statistic::new("StorageDrive", "queued_requests", 3.0);
        assert_eq!(statistic.to_string(), "StorageDrive.queued_requests = 3.000");
    }
}
