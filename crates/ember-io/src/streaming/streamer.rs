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

//! The streamer: owns the stack and the thread that drives it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ember_core::io::{
    PathAliases, Recommendations, RequestMemoryAllocator, RequestPath, RequestStatus,
};
use ember_data::allocators::{DefaultRequestMemoryAllocator, OsAllocator};

use super::context::StreamerContext;
use super::lock;
use super::request::{
    CompletionCallback, FailureReason, FileRequestPtr, ReadBuffer, ReadRequestData,
    RequestCommand, RequestHandle, READ_TO_END,
};
use super::stack::{Status, StreamStack, StreamStackEntry};
use super::stages::{BlockCacheStage, DecompressionStage, StorageDriveStage};
use super::statistics::Statistic;
use crate::compression::CompressionBus;
use crate::config::StreamerConfig;
use crate::error::StreamResult;

/// How long the scheduler sleeps when nothing signals it.
const IDLE_TIMEOUT: Duration = Duration::from_millis(50);

/// Asynchronous file reader.
///
/// Requests are submitted from any thread and executed by a dedicated
/// scheduler thread that drives the [`StreamStack`]. Each tick it prepares new
/// submissions, queues prepared requests while the stack reports free slots,
/// executes until no stage has work left, finalizes completed requests and
/// refreshes completion estimates. Completion callbacks run on the scheduler
/// thread.
///
/// Dropping the streamer stops the thread; requests that have not finished by
/// then fail with [`FailureReason::Canceled`].
pub struct Streamer {
    context: Arc<StreamerContext>,
    stack: Arc<Mutex<StreamStack>>,
    submissions: flume::Sender<FileRequestPtr>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    recommendations: Recommendations,
    aliases: Arc<PathAliases>,
}

impl Streamer {
    /// Creates a streamer with the default stack: decompression, block cache
    /// (unless `block_count` is 0) and storage drive.
    pub fn new(config: &StreamerConfig, bus: Arc<CompressionBus>) -> StreamResult<Self> {
        config.validate()?;
        let recommendations = config.recommendations();
        let mut stages: Vec<Box<dyn StreamStackEntry>> = vec![Box::new(DecompressionStage::new(
            bus,
            &config.decompression,
            recommendations,
        ))];
        if config.block_cache.block_count > 0 {
            stages.push(Box::new(BlockCacheStage::new(
                &config.block_cache,
                recommendations,
            )));
        }
        stages.push(Box::new(StorageDriveStage::new(
            &config.storage_drive,
            &config.retry,
            recommendations,
        )));
        Self::with_stages(config, stages)
    }

    /// Creates a streamer driving `stages`, head first.
    pub fn with_stages(
        config: &StreamerConfig,
        stages: Vec<Box<dyn StreamStackEntry>>,
    ) -> StreamResult<Self> {
        config.validate()?;
        let aliases = Arc::new(config.path_aliases()?);
        let context = StreamerContext::new();
        let mut stack = StreamStack::new(context.clone());
        for stage in stages {
            stack.push_boxed_stage(stage);
        }
        log::info!("Streamer stack: {}", stack.stage_names().join(" -> "));
        let stack = Arc::new(Mutex::new(stack));

        let (submissions, incoming) = flume::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let stack = stack.clone();
            let context = context.clone();
            let running = running.clone();
            thread::spawn(move || run_scheduler(&stack, &context, &incoming, &running))
        };

        Ok(Self {
            context,
            stack,
            submissions,
            running,
            handle: Some(handle),
            recommendations: config.recommendations(),
            aliases,
        })
    }

    pub fn context(&self) -> &Arc<StreamerContext> {
        &self.context
    }

    pub fn recommendations(&self) -> Recommendations {
        self.recommendations
    }

    /// The aliases configured for this streamer.
    pub fn aliases(&self) -> &Arc<PathAliases> {
        &self.aliases
    }

    /// A path that may start with one of the configured aliases.
    pub fn path(&self, path: impl Into<String>) -> RequestPath {
        RequestPath::from_relative(path, self.aliases.clone())
    }

    /// A request buffer allocator over the system allocator, sized by this
    /// streamer's recommendations.
    pub fn create_request_allocator(&self) -> Arc<DefaultRequestMemoryAllocator> {
        Arc::new(DefaultRequestMemoryAllocator::new(
            Arc::new(OsAllocator::default()),
            self.recommendations,
        ))
    }

    /// Submits `command`. `callback` runs on the scheduler thread once the
    /// request has finished.
    pub fn submit(
        &self,
        command: RequestCommand,
        callback: Option<CompletionCallback>,
    ) -> RequestHandle {
        let request = self.context.create_request(command);
        if let Some(callback) = callback {
            request.set_callback(callback);
        }
        let handle = RequestHandle::new(request.clone());
        log::trace!("Streamer: submitting request {}", request.id());
        if let Err(flume::SendError(request)) = self.submissions.send(request) {
            log::warn!("Streamer: request {} submitted after shutdown", request.id());
            request.fail(FailureReason::Canceled);
            request.notify_completion();
        } else {
            self.context.resume();
        }
        handle
    }

    /// Reads `size` bytes at `offset` into `buffer`, which is resized to fit.
    pub fn read(
        &self,
        path: RequestPath,
        offset: u64,
        size: u64,
        buffer: Vec<u8>,
    ) -> RequestHandle {
        self.submit(
            RequestCommand::Read(ReadRequestData::new(
                path,
                offset,
                size,
                ReadBuffer::Vec(buffer),
            )),
            None,
        )
    }

    /// Reads into a buffer allocated from `allocator` with aligned offset and size.
    pub fn read_with_allocator(
        &self,
        path: RequestPath,
        offset: u64,
        size: u64,
        allocator: Arc<dyn RequestMemoryAllocator>,
    ) -> RequestHandle {
        self.submit(
            RequestCommand::Read(ReadRequestData::new(
                path,
                offset,
                size,
                ReadBuffer::with_allocator(allocator),
            )),
            None,
        )
    }

    /// Reads a whole file.
    pub fn read_file(&self, path: RequestPath) -> RequestHandle {
        self.read(path, 0, READ_TO_END, Vec::new())
    }

    pub fn file_exists(&self, path: RequestPath) -> RequestHandle {
        self.submit(RequestCommand::FileExistsCheck { path, found: false }, None)
    }

    pub fn file_size(&self, path: RequestPath) -> RequestHandle {
        self.submit(
            RequestCommand::FileMetaDataRetrieval {
                path,
                file_size: None,
            },
            None,
        )
    }

    /// Drops cached blocks and open handles of one file.
    pub fn flush(&self, path: RequestPath) -> RequestHandle {
        self.submit(RequestCommand::Flush { path }, None)
    }

    pub fn flush_all(&self) -> RequestHandle {
        self.submit(RequestCommand::FlushAll, None)
    }

    /// Statistics of every stage, head first.
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let mut statistics = lock(&self.stack).collect_statistics();
        statistics.push(Statistic::new(
            "Streamer",
            "completed_requests",
            self.context.completed_total() as f64,
        ));
        statistics.push(Statistic::new(
            "Streamer",
            "failed_requests",
            self.context.failed_total() as f64,
        ));
        statistics
    }

    /// The stack's current capacity report.
    pub fn status(&self) -> Status {
        lock(&self.stack).update_status()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the scheduler thread and fails every unfinished request.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) && self.handle.is_none() {
            return;
        }
        self.context.resume();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Streamer scheduler thread panicked");
            }
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(
    stack: &Mutex<StreamStack>,
    context: &StreamerContext,
    incoming: &flume::Receiver<FileRequestPtr>,
    running: &AtomicBool,
) {
    log::info!("Streamer scheduler started.");
    let mut tracked: Vec<FileRequestPtr> = Vec::new();

    while running.load(Ordering::Acquire) {
        let mut progressed = false;
        {
            let mut stack = lock(stack);

            // 1. Prepare new submissions
            for request in incoming.try_iter() {
                progressed = true;
                tracked.push(request.clone());
                stack.prepare_request(request);
            }

            // 2. Queue while the stack has room
            let mut slots = stack.update_status().num_available_slots;
            while slots > 0 {
                let Some(request) = context.pop_prepared_request() else {
                    break;
                };
                progressed = true;
                stack.queue_request(request);
                slots -= 1;
            }

            // 3. Execute until no stage has work; stages see finished
            // requests before their callers can take the buffers.
            while stack.execute_requests() {
                progressed = true;
            }

            // 4. Estimates
            tracked.retain(|request| !request.status().is_terminal());
            let queued: Vec<FileRequestPtr> = tracked
                .iter()
                .filter(|request| request.status() != RequestStatus::Pending)
                .cloned()
                .collect();
            let prepared = context.prepared_requests();
            stack.update_completion_estimates(Instant::now(), &queued, &prepared);
        }

        // 5. Callbacks and handles, outside the stack lock
        if context.finalize_completed_requests() > 0 {
            progressed = true;
        }

        if !progressed {
            context.suspend(Some(IDLE_TIMEOUT));
        }
    }

    tracked.extend(incoming.try_iter());
    let mut canceled = 0;
    for request in tracked {
        if !request.status().is_terminal() {
            request.fail(FailureReason::Canceled);
            context.mark_request_as_completed(request);
            canceled += 1;
        }
    }
    while context.pop_prepared_request().is_some() {}
    context.finalize_completed_requests();
    if canceled > 0 {
        log::warn!("Streamer stopped with {canceled} unfinished requests");
    }
    log::info!("Streamer scheduler stopped.");
}
