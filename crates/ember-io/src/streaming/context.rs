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

//! State shared by the streamer thread and every stage of its stack.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use ember_core::io::RequestStatus;

use super::lock;
use super::request::{FileRequest, FileRequestPtr, RequestCommand};

/// Number of events the streamer thread can wait on at once, including the
/// one reserved for waking it up.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

const WAKE_SLOT: usize = 0;

#[derive(Debug, Default)]
struct WaitState {
    registered: u64,
    signaled: u64,
}

#[derive(Debug, Default)]
struct WaitSet {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

impl WaitSet {
    fn signal(&self, slot: usize) {
        let mut state = lock(&self.state);
        state.signaled |= 1 << slot;
        self.condvar.notify_all();
    }
}

/// An event a stage registered with the context.
///
/// Signalling it wakes the streamer thread. Clones signal the same event, so
/// worker threads can each keep one.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    slot: usize,
    wait_set: Arc<WaitSet>,
}

impl StreamEvent {
    pub fn signal(&self) {
        self.wait_set.signal(self.slot);
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Owns the prepared and completed request queues and the streamer's wait set.
#[derive(Debug)]
pub struct StreamerContext {
    prepared: Mutex<VecDeque<FileRequestPtr>>,
    completed: Mutex<VecDeque<FileRequestPtr>>,
    wait_set: Arc<WaitSet>,
    next_request_id: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl Default for StreamerContext {
    fn default() -> Self {
        let wait_set = WaitSet::default();
        lock(&wait_set.state).registered = 1 << WAKE_SLOT;
        Self {
            prepared: Mutex::new(VecDeque::new()),
            completed: Mutex::new(VecDeque::new()),
            wait_set: Arc::new(wait_set),
            next_request_id: AtomicU64::new(1),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }
}

impl StreamerContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a request submitted by a caller.
    pub fn create_request(&self, command: RequestCommand) -> FileRequestPtr {
        FileRequest::new(self.next_id(), command, false)
    }

    /// Creates a request a stage issues on behalf of another request.
    pub fn create_internal_request(&self, command: RequestCommand) -> FileRequestPtr {
        FileRequest::new(self.next_id(), command, true)
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a request that went through every stage's preparation.
    pub fn push_prepared_request(&self, request: FileRequestPtr) {
        lock(&self.prepared).push_back(request);
    }

    /// Takes the oldest prepared request.
    pub fn pop_prepared_request(&self) -> Option<FileRequestPtr> {
        lock(&self.prepared).pop_front()
    }

    /// A snapshot of the prepared requests, oldest first.
    pub fn prepared_requests(&self) -> Vec<FileRequestPtr> {
        lock(&self.prepared).iter().cloned().collect()
    }

    pub fn num_prepared_requests(&self) -> usize {
        lock(&self.prepared).len()
    }

    /// Hands a finished request back for finalization and wakes the streamer.
    ///
    /// Must be called exactly once per request, after its status has become
    /// terminal.
    pub fn mark_request_as_completed(&self, request: FileRequestPtr) {
        debug_assert!(
            request.status().is_terminal(),
            "request {} marked as completed while {}",
            request.id(),
            request.status()
        );
        match request.status() {
            _ if request.is_internal() => {}
            RequestStatus::Failed => {
                self.failed_total.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Request {} failed: {}",
                    request.id(),
                    request
                        .failure_reason()
                        .map_or_else(|| "unknown".to_string(), |reason| reason.to_string())
                );
            }
            _ => {
                self.completed_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        lock(&self.completed).push_back(request);
        self.resume();
    }

    /// Runs callbacks and wakes handles for every request marked as completed.
    ///
    /// Returns how many requests were finalized.
    pub fn finalize_completed_requests(&self) -> usize {
        let completed = mem::take(&mut *lock(&self.completed));
        let count = completed.len();
        for request in completed {
            request.notify_completion();
        }
        count
    }

    /// Number of caller requests marked as completed that succeeded.
    pub fn completed_total(&self) -> u64 {
        self.completed_total.load(Ordering::Relaxed)
    }

    /// Number of caller requests marked as completed that failed.
    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }

    pub fn are_event_handles_available(&self) -> bool {
        lock(&self.wait_set.state).registered != u64::MAX
    }

    /// Registers an event that wakes the streamer thread when signalled.
    ///
    /// # Panics
    ///
    /// Panics if all [`MAXIMUM_WAIT_OBJECTS`] slots are taken.
    pub fn register_event(&self) -> StreamEvent {
        let mut state = lock(&self.wait_set.state);
        let free = !state.registered;
        assert!(free != 0, "no event handles available in the streamer context");
        let slot = free.trailing_zeros() as usize;
        state.registered |= 1 << slot;
        state.signaled &= !(1 << slot);
        StreamEvent {
            slot,
            wait_set: self.wait_set.clone(),
        }
    }

    /// Releases an event's slot.
    pub fn unregister_event(&self, event: StreamEvent) {
        if event.slot == WAKE_SLOT || !Arc::ptr_eq(&event.wait_set, &self.wait_set) {
            return;
        }
        let mut state = lock(&self.wait_set.state);
        state.registered &= !(1 << event.slot);
        state.signaled &= !(1 << event.slot);
    }

    /// Blocks until an event is signalled or `timeout` elapses.
    ///
    /// Returns the mask of slots that were signalled, clearing them.
    pub fn suspend(&self, timeout: Option<Duration>) -> u64 {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.wait_set.state);
        while state.signaled == 0 {
            match deadline {
                None => {
                    state = self
                        .wait_set
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = self
                        .wait_set
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        mem::take(&mut state.signaled)
    }

    /// Wakes the streamer thread.
    pub fn resume(&self) {
        self.wait_set.signal(WAKE_SLOT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::FailureReason;
    use std::thread;

    #[test]
    fn test_event_slots_run_out_and_come_back() {
        let context = StreamerContext::new();
        let mut events: Vec<_> = (1..MAXIMUM_WAIT_OBJECTS)
            .map(|_| context.register_event())
            .collect();
        assert!(!context.are_event_handles_available());
        assert!(events.iter().all(|event| event.slot() != WAKE_SLOT));

        let event = events.pop().unwrap();
        let slot = event.slot();
        context.unregister_event(event);
        assert!(context.are_event_handles_available());
        assert_eq!(context.register_event().slot(), slot);
    }

    #[test]
    #[should_panic(expected = "no event handles available")]
    fn test_registering_too_many_events_panics() {
        let context = StreamerContext::new();
        for _ in 0..MAXIMUM_WAIT_OBJECTS {
            context.register_event();
        }
    }

    #[test]
    fn test_signal_from_another_thread_wakes_suspend() {
        let context = StreamerContext::new();
        let event = context.register_event();
        let slot = event.slot();
        let worker = thread::spawn(move || event.signal());
        let mut mask = 0;
        while mask == 0 {
            mask = context.suspend(Some(Duration::from_secs(5)));
        }
        worker.join().unwrap();
        assert_eq!(mask, 1 << slot);
    }

    #[test]
    fn test_suspend_times_out_without_signal() {
        let context = StreamerContext::new();
        assert_eq!(context.suspend(Some(Duration::from_millis(5))), 0);
    }

    #[test]
    fn test_completion_is_counted_and_finalized_once() {
        let context = StreamerContext::new();
        let ok = context.create_request(RequestCommand::FlushAll);
        let failed = context.create_request(RequestCommand::FlushAll);
        assert_ne!(ok.id(), failed.id());

        ok.complete();
        failed.fail(FailureReason::Unhandled);
        context.mark_request_as_completed(ok);
        context.mark_request_as_completed(failed);

        assert_eq!(context.completed_total(), 1);
        assert_eq!(context.failed_total(), 1);
        // Marking resumes the streamer.
        assert_eq!(context.suspend(Some(Duration::ZERO)), 1 << WAKE_SLOT);
        assert_eq!(context.finalize_completed_requests(), 2);
        assert_eq!(context.finalize_completed_requests(), 0);
    }

    #[test]
    fn test_internal_requests_are_not_counted() {
        let context = StreamerContext::new();
        let child = context.create_internal_request(RequestCommand::FlushAll);
        let failed_child = context.create_internal_request(RequestCommand::FlushAll);
        child.complete();
        failed_child.fail(FailureReason::Unhandled);
        context.mark_request_as_completed(child);
        context.mark_request_as_completed(failed_child);

        assert_eq!(context.completed_total(), 0);
        assert_eq!(context.failed_total(), 0);
        assert_eq!(context.finalize_completed_requests(), 2);
    }

    #[test]
    fn test_prepared_queue_is_fifo() {
        let context = StreamerContext::new();
        let first = context.create_request(RequestCommand::FlushAll);
        let second = context.create_request(RequestCommand::FlushAll);
        context.push_prepared_request(first.clone());
        context.push_prepared_request(second.clone());
        assert_eq!(context.num_prepared_requests(), 2);
        assert_eq!(context.pop_prepared_request().unwrap().id(), first.id());
        assert_eq!(context.pop_prepared_request().unwrap().id(), second.id());
        assert!(context.pop_prepared_request().is_none());
    }
}
