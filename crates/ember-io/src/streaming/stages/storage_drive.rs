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

//! The terminal stage: executes requests against the file system.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use ember_core::io::{Recommendations, RequestPath, RequestStatus};

use crate::config::{RetryConfig, StorageDriveConfig};
use crate::error::StreamError;
use crate::stream::{retry_open_stream, ByteStream, FileStream, OpenMode};
use crate::streaming::{
    AverageWindow, FailureReason, FileRequestPtr, Next, NextRef, ReadRequestData, RequestCommand,
    Statistic, Status, StreamStackEntry, READ_TO_END,
};

/// Throughput assumed before the first read has been measured, in bytes per second.
const DEFAULT_THROUGHPUT: f64 = 100.0 * 1024.0 * 1024.0;

/// Time assumed for requests that do not transfer data.
const METADATA_COST: Duration = Duration::from_micros(50);

fn failure_from(error: StreamError) -> FailureReason {
    match error {
        StreamError::Io(error) => error.into(),
        _ => FailureReason::Io(std::io::ErrorKind::Other),
    }
}

struct CachedHandle {
    hash: u64,
    stream: FileStream,
    last_used: u64,
}

/// Least-recently-used cache of open files.
struct FileHandleCache {
    capacity: usize,
    handles: Vec<CachedHandle>,
    clock: u64,
    opened: u64,
}

impl FileHandleCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            handles: Vec::new(),
            clock: 0,
            opened: 0,
        }
    }

    fn get_or_open(
        &mut self,
        path: &RequestPath,
        retry: &RetryConfig,
    ) -> Result<&mut FileStream, FailureReason> {
        self.clock += 1;
        let hash = path.path_hash();
        if let Some(index) = self.handles.iter().position(|handle| handle.hash == hash) {
            let handle = &mut self.handles[index];
            handle.last_used = self.clock;
            return Ok(&mut handle.stream);
        }

        if !Path::new(path.absolute_path()).is_file() {
            return Err(FailureReason::FileNotFound);
        }
        let mut stream = FileStream::closed(path.absolute_path(), OpenMode::Read);
        if !retry_open_stream(
            &mut stream,
            retry.attempts,
            Duration::from_millis(retry.delay_ms),
        ) {
            return Err(FailureReason::FileNotFound);
        }
        self.opened += 1;

        if self.handles.len() >= self.capacity {
            if let Some(oldest) = self
                .handles
                .iter()
                .enumerate()
                .min_by_key(|(_, handle)| handle.last_used)
                .map(|(index, _)| index)
            {
                let mut evicted = self.handles.swap_remove(oldest);
                evicted.stream.close();
            }
        }
        self.handles.push(CachedHandle {
            hash,
            stream,
            last_used: self.clock,
        });
        let last = self.handles.len() - 1;
        Ok(&mut self.handles[last].stream)
    }

    fn close(&mut self, hash: u64) {
        self.handles.retain_mut(|handle| {
            if handle.hash == hash {
                handle.stream.close();
                false
            } else {
                true
            }
        });
    }

    fn close_all(&mut self) {
        for handle in &mut self.handles {
            handle.stream.close();
        }
        self.handles.clear();
    }
}

/// Reads files from disk, a bounded number of requests per tick.
///
/// Reads into allocator-backed buffers start at the offset rounded down to
/// the size alignment and cover the recommended memory size, so the request's
/// data sits `padding` bytes into the buffer.
pub struct StorageDriveStage {
    config: StorageDriveConfig,
    retry: RetryConfig,
    recommendations: Recommendations,
    queue: VecDeque<FileRequestPtr>,
    handles: FileHandleCache,
    throughput: AverageWindow,
    latency: AverageWindow,
    bytes_read: u64,
}

impl StorageDriveStage {
    pub fn new(
        config: &StorageDriveConfig,
        retry: &RetryConfig,
        recommendations: Recommendations,
    ) -> Self {
        Self {
            config: config.clone(),
            retry: retry.clone(),
            recommendations,
            queue: VecDeque::new(),
            handles: FileHandleCache::new(config.max_file_handles),
            throughput: AverageWindow::default(),
            latency: AverageWindow::default(),
            bytes_read: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.config.max_requests_per_tick + self.config.overcommit
    }

    fn execute(&mut self, request: &FileRequestPtr) -> Result<(), FailureReason> {
        let mut command = request.command();
        match &mut *command {
            RequestCommand::Read(read) => self.read(read),
            RequestCommand::FileExistsCheck { path, found } => {
                *found = path.is_valid() && Path::new(path.absolute_path()).is_file();
                Ok(())
            }
            RequestCommand::FileMetaDataRetrieval { path, file_size } => {
                if !path.is_valid() {
                    return Err(FailureReason::FileNotFound);
                }
                let metadata = std::fs::metadata(path.absolute_path())?;
                if !metadata.is_file() {
                    return Err(FailureReason::FileNotFound);
                }
                *file_size = Some(metadata.len());
                Ok(())
            }
            RequestCommand::Flush { path } => {
                self.handles.close(path.path_hash());
                Ok(())
            }
            RequestCommand::FlushAll => {
                self.handles.close_all();
                Ok(())
            }
            RequestCommand::CompressedRead(_) => Err(FailureReason::Unhandled),
        }
    }

    fn read(&mut self, read: &mut ReadRequestData) -> Result<(), FailureReason> {
        if !read.path.is_valid() {
            return Err(FailureReason::FileNotFound);
        }
        let started = Instant::now();
        let stream = self.handles.get_or_open(&read.path, &self.retry)?;
        let file_size = stream.size().map_err(failure_from)?;
        read.file_size = Some(file_size);

        let size = if read.size == READ_TO_END {
            file_size.saturating_sub(read.offset)
        } else {
            read.size
        };
        match read.offset.checked_add(size) {
            Some(end) if end <= file_size => {}
            _ => return Err(FailureReason::ReadPastEnd),
        }
        read.size = size;
        let size = usize::try_from(size).map_err(|_| FailureReason::OutOfMemory)?;

        let (start, padding, recommended) = if read.output.is_allocator_target() {
            let aligned = read.offset & !(self.recommendations.size_alignment() - 1);
            let recommended = self
                .recommendations
                .calculate_recommended_memory_size(read.size, read.offset);
            (aligned, (read.offset - aligned) as usize, recommended)
        } else {
            (read.offset, 0, read.size)
        };
        read.output.reserve(
            padding,
            size,
            recommended,
            self.recommendations.memory_alignment(),
        )?;
        read.padding = padding;

        let buffer = read.output.as_mut_slice();
        let wanted = usize::try_from(recommended)
            .unwrap_or(usize::MAX)
            .min(buffer.len());
        let filled = stream
            .read_at(start, &mut buffer[..wanted])
            .map_err(failure_from)?;
        if filled < padding + size {
            return Err(FailureReason::ReadPastEnd);
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.latency.push(elapsed * 1000.0);
        if elapsed > 0.0 {
            self.throughput.push(filled as f64 / elapsed);
        }
        self.bytes_read += filled as u64;
        Ok(())
    }

    fn estimated_cost(&self, request: &FileRequestPtr) -> Duration {
        let throughput = if self.throughput.is_empty() {
            DEFAULT_THROUGHPUT
        } else {
            self.throughput.average().max(1.0)
        };
        match &*request.command() {
            RequestCommand::Read(read) if read.size != READ_TO_END => {
                METADATA_COST + Duration::from_secs_f64(read.size as f64 / throughput)
            }
            _ => METADATA_COST,
        }
    }
}

impl StreamStackEntry for StorageDriveStage {
    fn name(&self) -> &str {
        "StorageDrive"
    }

    fn queue_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        let owned = !matches!(&*request.command(), RequestCommand::CompressedRead(_));
        if owned {
            log::trace!("StorageDrive: queued request {}", request.id());
            self.queue.push_back(request);
        } else {
            next.queue_request(request);
        }
    }

    fn execute_requests(&mut self, next: Next<'_>) -> bool {
        let context = next.context().clone();
        let mut executed = 0;
        while executed < self.config.max_requests_per_tick.max(1) {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            executed += 1;
            if request.is_cancelled() {
                request.fail(FailureReason::Canceled);
            } else {
                request.set_status(RequestStatus::Processing);
                match self.execute(&request) {
                    Ok(()) => request.complete(),
                    Err(reason) => {
                        log::debug!("StorageDrive: request {} failed: {reason}", request.id());
                        request.fail(reason);
                    }
                }
            }
            context.mark_request_as_completed(request);
        }
        if executed > 0 {
            true
        } else {
            next.execute_requests()
        }
    }

    fn update_status(&self, status: &mut Status, next: NextRef<'_>) {
        let free = self.capacity() as i64 - self.queue.len() as i64;
        status.num_available_slots = status.num_available_slots.min(free.max(0));
        status.is_idle &= self.queue.is_empty();
        next.update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[FileRequestPtr],
        pending: &[FileRequestPtr],
        next: Next<'_>,
    ) {
        let mut at = now;
        for request in self.queue.iter().chain(pending) {
            at += self.estimated_cost(request);
            request.set_estimated_completion(at);
        }
        next.update_completion_estimates(now, internal_pending, pending);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>, next: NextRef<'_>) {
        let name = self.name();
        statistics.push(Statistic::new(
            name,
            "throughput_mib_per_s",
            self.throughput.average() / (1024.0 * 1024.0),
        ));
        statistics.push(Statistic::new(name, "read_latency_ms", self.latency.average()));
        statistics.push(Statistic::new(name, "queued_requests", self.queue.len() as f64));
        statistics.push(Statistic::new(
            name,
            "open_file_handles",
            self.handles.handles.len() as f64,
        ));
        statistics.push(Statistic::new(name, "files_opened", self.handles.opened as f64));
        statistics.push(Statistic::new(name, "bytes_read", self.bytes_read as f64));
        next.collect_statistics(statistics);
    }
}

impl Drop for StorageDriveStage {
    fn drop(&mut self) {
        self.handles.close_all();
        if !self.queue.is_empty() {
            log::warn!(
                "StorageDrive dropped with {} queued requests",
                self.queue.len()
            );
        }
    }
}
