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

//! Turns reads of archived files into archive reads plus decompression.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use ember_core::io::{
    CompressionInfo, ConflictResolution, Recommendations, RequestPath, RequestStatus,
};

use crate::compression::{CompressionBus, CompressionHeader, MAX_EXPANSION_RATIO};
use crate::config::DecompressionConfig;
use crate::streaming::{
    AverageWindow, FailureReason, FileRequestPtr, Next, NextRef, ReadBuffer, ReadRequestData,
    RequestCommand, Statistic, Status, StreamEvent, StreamStackEntry, StreamerContext,
    READ_TO_END,
};

struct PendingRead {
    parent: FileRequestPtr,
    child: FileRequestPtr,
    compressed_size: u64,
}

struct Job {
    parent: FileRequestPtr,
    info: CompressionInfo,
    compressed: Vec<u8>,
}

struct JobResult {
    parent: FileRequestPtr,
    data: Result<Vec<u8>, FailureReason>,
    compressed_len: u64,
    elapsed: Duration,
}

/// Decodes one entry. Always produces a result, even if the decompression
/// function panics, so the parent request is never left unfinished.
fn run_job(job: Job) -> JobResult {
    let started = Instant::now();
    let Job {
        parent,
        info,
        compressed,
    } = job;
    let compressed_len = compressed.len() as u64;
    let data = panic::catch_unwind(AssertUnwindSafe(|| decompress(&info, &compressed)))
        .unwrap_or_else(|_| {
            log::error!(
                "Decompression: decoder panicked on an entry of '{}'",
                info.archive_filename
            );
            Err(FailureReason::CorruptData)
        });
    JobResult {
        parent,
        data,
        compressed_len,
        elapsed: started.elapsed(),
    }
}

fn decompress(info: &CompressionInfo, compressed: &[u8]) -> Result<Vec<u8>, FailureReason> {
    if !CompressionHeader::is_valid(compressed) {
        return Err(FailureReason::CorruptData);
    }
    let limit = (compressed.len() as u64).saturating_mul(MAX_EXPANSION_RATIO);
    if info.uncompressed_size > limit {
        log::warn!(
            "Decompression: entry of '{}' announces {} bytes from {} stored bytes",
            info.archive_filename,
            info.uncompressed_size,
            compressed.len()
        );
        return Err(FailureReason::CorruptData);
    }
    let len = usize::try_from(info.uncompressed_size).map_err(|_| FailureReason::OutOfMemory)?;
    let mut output = Vec::new();
    output
        .try_reserve_exact(len)
        .map_err(|_| FailureReason::OutOfMemory)?;
    output.resize(len, 0);
    if info.decompress(compressed, &mut output) {
        Ok(output)
    } else {
        Err(FailureReason::CorruptData)
    }
}

enum Planned {
    Forward,
    Child(FileRequestPtr, u64),
    Failed(FailureReason),
}

/// Serves files that live inside archives.
///
/// During preparation every read is looked up on the [`CompressionBus`]; hits
/// become [`RequestCommand::CompressedRead`]s unless the entry's conflict
/// resolution prefers an existing loose file. Entries stored without
/// compression are turned into plain reads of the archive range. Compressed
/// entries are fetched whole with an internal read, decoded on worker threads
/// and the requested window is copied into the caller's buffer.
///
/// At most `max_buffered_bytes` of compressed data wait for or sit in the
/// workers at once; while the limit is reached the stage reports no free
/// slots. With `max_jobs` set to 0 decoding runs on the streamer thread.
pub struct DecompressionStage {
    bus: Arc<CompressionBus>,
    config: DecompressionConfig,
    recommendations: Recommendations,
    pending: Vec<PendingRead>,
    jobs: Option<Sender<Job>>,
    results_tx: Sender<JobResult>,
    results_rx: Receiver<JobResult>,
    workers: Vec<thread::JoinHandle<()>>,
    event: Option<StreamEvent>,
    context: Option<Arc<StreamerContext>>,
    buffered_bytes: u64,
    jobs_in_flight: usize,
    decompression_ms: AverageWindow,
    compression_ratio: AverageWindow,
}

impl DecompressionStage {
    pub fn new(
        bus: Arc<CompressionBus>,
        config: &DecompressionConfig,
        recommendations: Recommendations,
    ) -> Self {
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        Self {
            bus,
            config: config.clone(),
            recommendations,
            pending: Vec::new(),
            jobs: None,
            results_tx,
            results_rx,
            workers: Vec::new(),
            event: None,
            context: None,
            buffered_bytes: 0,
            jobs_in_flight: 0,
            decompression_ms: AverageWindow::default(),
            compression_ratio: AverageWindow::default(),
        }
    }

    /// Number of worker threads currently running.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn start_workers(&mut self, context: &Arc<StreamerContext>) {
        if self.config.max_jobs == 0 {
            return;
        }
        let event = context.register_event();
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Job>();
        for _ in 0..self.config.max_jobs {
            let jobs = jobs_rx.clone();
            let results = self.results_tx.clone();
            let event = event.clone();
            self.workers.push(thread::spawn(move || {
                for job in jobs.iter() {
                    if results.send(run_job(job)).is_err() {
                        break;
                    }
                    event.signal();
                }
            }));
        }
        log::debug!("Decompression: started {} workers", self.workers.len());
        self.jobs = Some(jobs_tx);
        self.event = Some(event);
    }

    fn stop_workers(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Decompression worker panicked");
            }
        }
        if let (Some(event), Some(context)) = (self.event.take(), &self.context) {
            context.unregister_event(event);
        }
    }

    fn use_archive(path: &RequestPath, info: &CompressionInfo) -> bool {
        match info.conflict_resolution {
            ConflictResolution::PreferFile => {
                !(path.is_valid() && Path::new(path.absolute_path()).is_file())
            }
            ConflictResolution::PreferArchive | ConflictResolution::UseArchiveOnly => true,
        }
    }

    fn plan(command: &mut RequestCommand, context: &StreamerContext) -> Planned {
        let RequestCommand::CompressedRead(read) = command else {
            return Planned::Forward;
        };
        let size = if read.size == READ_TO_END {
            read.info.uncompressed_size.saturating_sub(read.offset)
        } else {
            read.size
        };
        match read.offset.checked_add(size) {
            Some(end) if end <= read.info.uncompressed_size => {}
            _ => return Planned::Failed(FailureReason::ReadPastEnd),
        }
        read.size = size;
        let archive = read.info.archive_filename.clone();

        if !read.info.is_compressed {
            let offset = read.info.offset + read.offset;
            let output = mem::take(&mut read.output);
            *command = RequestCommand::Read(ReadRequestData::new(archive, offset, size, output));
            return Planned::Forward;
        }

        let compressed_size = read.info.compressed_size;
        let child = context.create_internal_request(RequestCommand::Read(ReadRequestData::new(
            archive,
            read.info.offset,
            compressed_size,
            ReadBuffer::default(),
        )));
        Planned::Child(child, compressed_size)
    }

    fn has_room_for(&self, bytes: u64) -> bool {
        self.jobs_in_flight == 0
            || self.buffered_bytes.saturating_add(bytes) <= self.config.max_buffered_bytes
    }

    /// Hands finished archive reads to the workers. Returns `true` if any
    /// pending read was resolved.
    fn dispatch_finished_reads(&mut self, context: &StreamerContext) -> bool {
        let mut worked = false;
        let mut index = 0;
        while index < self.pending.len() {
            let entry = &self.pending[index];
            if entry.parent.is_cancelled() {
                entry.child.cancel();
            }
            let child_status = entry.child.status();
            if !child_status.is_terminal() {
                index += 1;
                continue;
            }
            let dispatching =
                child_status == RequestStatus::Completed && !entry.parent.is_cancelled();
            if dispatching && !self.has_room_for(entry.compressed_size) {
                index += 1;
                continue;
            }

            let PendingRead { parent, child, .. } = self.pending.remove(index);
            worked = true;
            if parent.is_cancelled() {
                parent.fail(FailureReason::Canceled);
                context.mark_request_as_completed(parent);
                continue;
            }
            if child_status == RequestStatus::Failed {
                parent.fail(child.failure_reason().unwrap_or(FailureReason::Unhandled));
                context.mark_request_as_completed(parent);
                continue;
            }

            let compressed = match &mut *child.command() {
                RequestCommand::Read(read) => mem::take(&mut read.output).into_vec(),
                _ => Vec::new(),
            };
            let info = match &*parent.command() {
                RequestCommand::CompressedRead(read) => Some(read.info.clone()),
                _ => None,
            };
            let Some(info) = info else {
                parent.fail(FailureReason::Unhandled);
                context.mark_request_as_completed(parent);
                continue;
            };
            self.submit(
                Job {
                    parent,
                    info,
                    compressed,
                },
                context,
            );
        }
        worked
    }

    fn submit(&mut self, job: Job, context: &StreamerContext) {
        self.buffered_bytes += job.compressed.len() as u64;
        self.jobs_in_flight += 1;
        let job = match &self.jobs {
            Some(jobs) => match jobs.send(job) {
                Ok(()) => return,
                Err(error) => error.into_inner(),
            },
            None => job,
        };
        let result = run_job(job);
        self.finish(result, context);
    }

    /// Collects decoded entries from the workers.
    fn drain_results(&mut self, context: &StreamerContext) -> bool {
        let mut worked = false;
        while let Ok(result) = self.results_rx.try_recv() {
            worked = true;
            self.finish(result, context);
        }
        worked
    }

    fn finish(&mut self, result: JobResult, context: &StreamerContext) {
        self.jobs_in_flight = self.jobs_in_flight.saturating_sub(1);
        self.buffered_bytes = self.buffered_bytes.saturating_sub(result.compressed_len);
        self.decompression_ms
            .push(result.elapsed.as_secs_f64() * 1000.0);

        let JobResult {
            parent,
            data,
            compressed_len,
            ..
        } = result;
        let outcome = match data {
            Ok(data) => {
                if !data.is_empty() {
                    self.compression_ratio
                        .push(compressed_len as f64 / data.len() as f64);
                }
                self.copy_to_output(&parent, &data)
            }
            Err(reason) => Err(reason),
        };
        match outcome {
            Ok(()) => parent.complete(),
            Err(reason) => {
                log::warn!("Decompression: request {} failed: {reason}", parent.id());
                parent.fail(reason);
            }
        }
        context.mark_request_as_completed(parent);
    }

    fn copy_to_output(&self, parent: &FileRequestPtr, data: &[u8]) -> Result<(), FailureReason> {
        let mut command = parent.command();
        let RequestCommand::CompressedRead(read) = &mut *command else {
            return Err(FailureReason::Unhandled);
        };
        let start = usize::try_from(read.offset).map_err(|_| FailureReason::ReadPastEnd)?;
        let len = usize::try_from(read.size).map_err(|_| FailureReason::ReadPastEnd)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or(FailureReason::ReadPastEnd)?;
        let recommended = self
            .recommendations
            .calculate_recommended_memory_size(read.size, 0);
        read.output
            .reserve(0, len, recommended, self.recommendations.memory_alignment())?;
        read.output.as_mut_slice()[..len].copy_from_slice(&data[start..end]);
        Ok(())
    }
}

impl StreamStackEntry for DecompressionStage {
    fn name(&self) -> &str {
        "Decompression"
    }

    fn set_context(&mut self, context: &Arc<StreamerContext>) {
        if self
            .context
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, context))
        {
            return;
        }
        self.stop_workers();
        self.context = Some(context.clone());
        self.start_workers(context);
    }

    fn prepare_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        {
            let mut command = request.command();
            let info = match &*command {
                RequestCommand::Read(read) => self
                    .bus
                    .find_compression_info(&read.path)
                    .filter(|info| Self::use_archive(&read.path, info)),
                _ => None,
            };
            if let Some(info) = info {
                log::trace!(
                    "Decompression: request {} served from {}",
                    request.id(),
                    info.archive_filename
                );
                command.convert_to_compressed_read(info);
            }
        }
        next.prepare_request(request);
    }

    fn queue_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        let planned = Self::plan(&mut request.command(), next.context());
        match planned {
            Planned::Forward => next.queue_request(request),
            Planned::Failed(reason) => {
                request.fail(reason);
                next.context().mark_request_as_completed(request);
            }
            Planned::Child(child, compressed_size) => {
                request.set_status(RequestStatus::Processing);
                self.pending.push(PendingRead {
                    parent: request,
                    child: child.clone(),
                    compressed_size,
                });
                next.queue_request(child);
            }
        }
    }

    fn execute_requests(&mut self, next: Next<'_>) -> bool {
        let context = next.context().clone();
        let mut worked = self.drain_results(&context);
        worked |= self.dispatch_finished_reads(&context);
        if worked {
            true
        } else {
            next.execute_requests()
        }
    }

    fn update_status(&self, status: &mut Status, next: NextRef<'_>) {
        if self.buffered_bytes >= self.config.max_buffered_bytes {
            status.num_available_slots = 0;
        }
        status.is_idle &= self.pending.is_empty() && self.jobs_in_flight == 0;
        next.update_status(status);
    }

    fn update_completion_estimates(
        &mut self,
        now: Instant,
        internal_pending: &[FileRequestPtr],
        pending: &[FileRequestPtr],
        next: Next<'_>,
    ) {
        next.update_completion_estimates(now, internal_pending, pending);
        let cost = Duration::from_secs_f64(self.decompression_ms.average() / 1000.0);
        for entry in &self.pending {
            let base = entry.child.estimated_completion().unwrap_or(now);
            entry.parent.set_estimated_completion(base + cost);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>, next: NextRef<'_>) {
        let name = self.name();
        statistics.push(Statistic::new(
            name,
            "decompression_ms",
            self.decompression_ms.average(),
        ));
        statistics.push(Statistic::new(
            name,
            "compression_ratio",
            self.compression_ratio.average(),
        ));
        statistics.push(Statistic::new(name, "pending_reads", self.pending.len() as f64));
        statistics.push(Statistic::new(name, "jobs_in_flight", self.jobs_in_flight as f64));
        statistics.push(Statistic::new(name, "buffered_bytes", self.buffered_bytes as f64));
        next.collect_statistics(statistics);
    }
}

impl Drop for DecompressionStage {
    fn drop(&mut self) {
        self.stop_workers();
        if !self.pending.is_empty() {
            log::warn!(
                "Decompression stage dropped with {} pending reads",
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{lz4_decompression_func, CompressionProvider, Lz4Compressor};
    use crate::config::{RetryConfig, StorageDriveConfig};
    use crate::streaming::stages::StorageDriveStage;
    use crate::streaming::StreamStack;
    use ember_core::io::CompressionTag;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct SingleEntry {
        path: RequestPath,
        info: CompressionInfo,
    }

    impl CompressionProvider for SingleEntry {
        fn name(&self) -> &str {
            "single"
        }

        fn find_compression_info(&self, path: &RequestPath) -> Option<CompressionInfo> {
            (path == &self.path).then(|| self.info.clone())
        }
    }

    struct Fixture {
        _dir: TempDir,
        original: Vec<u8>,
        virtual_path: RequestPath,
        loose_path: RequestPath,
        bus: Arc<CompressionBus>,
    }

    /// An archive holding one LZ4 entry after a 7-byte prefix.
    fn fixture(conflict_resolution: ConflictResolution) -> Fixture {
        fixture_with(conflict_resolution, |_| {})
    }

    fn fixture_with(
        conflict_resolution: ConflictResolution,
        adjust: impl FnOnce(&mut CompressionInfo),
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let original: Vec<u8> = (0..20_000u32).map(|i| (i % 13) as u8).collect();
        let compressed = Lz4Compressor::new(4096).compress_to_vec(&original).unwrap();
        let mut archive = b"PREFIX!".to_vec();
        archive.extend_from_slice(&compressed);
        let archive_path = dir.path().join("bundle.pak");
        fs::write(&archive_path, &archive).unwrap();

        let loose = dir.path().join("loose.bin");
        fs::write(&loose, b"loose file").unwrap();
        let loose_path = RequestPath::from_absolute(loose.to_string_lossy());
        let virtual_path = loose_path.clone();

        let mut info = CompressionInfo {
            archive_filename: RequestPath::from_absolute(archive_path.to_string_lossy()),
            decompressor: Some(lz4_decompression_func()),
            compression_tag: CompressionTag::from_chars(*b"LZ4B"),
            offset: 7,
            compressed_size: compressed.len() as u64,
            uncompressed_size: original.len() as u64,
            conflict_resolution,
            is_compressed: true,
            is_shared_pak: true,
        };
        adjust(&mut info);

        let bus = Arc::new(CompressionBus::new());
        bus.connect(Arc::new(SingleEntry {
            path: virtual_path.clone(),
            info,
        }));
        Fixture {
            _dir: dir,
            original,
            virtual_path,
            loose_path,
            bus,
        }
    }

    fn stack(bus: Arc<CompressionBus>, max_jobs: usize) -> StreamStack {
        let recommendations = Recommendations::new(16, 512);
        StreamStack::new(StreamerContext::new())
            .with_stage(DecompressionStage::new(
                bus,
                &DecompressionConfig {
                    max_jobs,
                    ..Default::default()
                },
                recommendations,
            ))
            .with_stage(StorageDriveStage::new(
                &StorageDriveConfig::default(),
                &RetryConfig::default(),
                recommendations,
            ))
    }

    fn submit(
        stack: &mut StreamStack,
        path: &RequestPath,
        offset: u64,
        size: u64,
    ) -> FileRequestPtr {
        let request = stack
            .context()
            .create_request(RequestCommand::Read(ReadRequestData::new(
                path.clone(),
                offset,
                size,
                ReadBuffer::default(),
            )));
        stack.prepare_request(request.clone());
        let prepared = stack.context().pop_prepared_request().unwrap();
        stack.queue_request(prepared);
        request
    }

    fn run_until_done(stack: &mut StreamStack, request: &FileRequestPtr) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !request.status().is_terminal() {
            assert!(Instant::now() < deadline, "request did not finish");
            if !stack.execute_requests() {
                stack.context().suspend(Some(Duration::from_millis(10)));
            }
        }
    }

    fn output(request: &FileRequestPtr) -> Vec<u8> {
        match &*request.command() {
            RequestCommand::CompressedRead(read) => read.data().to_vec(),
            RequestCommand::Read(read) => read.data().to_vec(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_decodes_window_on_workers() {
        let fixture = fixture(ConflictResolution::PreferArchive);
        let mut stack = stack(fixture.bus.clone(), 2);
        let request = submit(&mut stack, &fixture.virtual_path, 5000, 3000);
        assert!(matches!(&*request.command(), RequestCommand::CompressedRead(_)));

        run_until_done(&mut stack, &request);
        assert_eq!(request.status(), RequestStatus::Completed);
        assert_eq!(output(&request), &fixture.original[5000..8000]);
    }

    #[test]
    fn test_decodes_inline_without_workers() {
        let fixture = fixture(ConflictResolution::UseArchiveOnly);
        let mut stack = stack(fixture.bus.clone(), 0);
        let request = submit(&mut stack, &fixture.virtual_path, 0, READ_TO_END);
        run_until_done(&mut stack, &request);
        assert_eq!(output(&request), fixture.original);
    }

    #[test]
    fn test_prefer_file_uses_the_loose_file() {
        let fixture = fixture(ConflictResolution::PreferFile);
        let mut stack = stack(fixture.bus.clone(), 1);
        let request = submit(&mut stack, &fixture.loose_path, 0, READ_TO_END);
        assert!(matches!(&*request.command(), RequestCommand::Read(_)));
        run_until_done(&mut stack, &request);
        assert_eq!(output(&request), b"loose file");
    }

    #[test]
    fn test_out_of_range_window_fails() {
        let fixture = fixture(ConflictResolution::PreferArchive);
        let mut stack = stack(fixture.bus.clone(), 1);
        let request = submit(&mut stack, &fixture.virtual_path, 19_990, 20);
        assert_eq!(request.failure_reason(), Some(FailureReason::ReadPastEnd));
    }

    #[test]
    fn test_corrupt_entry_fails() {
        let fixture = fixture(ConflictResolution::PreferArchive);
        // Replace the archive with bytes that carry no compression header.
        let info = fixture
            .bus
            .find_compression_info(&fixture.virtual_path)
            .unwrap();
        fs::write(info.archive_filename.absolute_path(), vec![0u8; 30_000]).unwrap();

        let mut stack = stack(fixture.bus.clone(), 1);
        let request = submit(&mut stack, &fixture.virtual_path, 0, 10);
        run_until_done(&mut stack, &request);
        assert_eq!(request.failure_reason(), Some(FailureReason::CorruptData));
    }

    #[test]
    fn test_cancelled_parent_is_failed() {
        let fixture = fixture(ConflictResolution::PreferArchive);
        let mut stack = stack(fixture.bus.clone(), 1);
        let request = submit(&mut stack, &fixture.virtual_path, 0, 10);
        request.cancel();
        run_until_done(&mut stack, &request);
        assert_eq!(request.failure_reason(), Some(FailureReason::Canceled));
        assert!(stack.update_status().is_idle);
    }

    #[test]
    fn test_oversized_entry_fails_without_allocating() {
        let fixture = fixture_with(ConflictResolution::PreferArchive, |info| {
            info.uncompressed_size = u64::MAX;
        });
        let mut stack = stack(fixture.bus.clone(), 1);
        let request = submit(&mut stack, &fixture.virtual_path, 0, 10);
        run_until_done(&mut stack, &request);
        assert_eq!(request.failure_reason(), Some(FailureReason::CorruptData));
        assert!(stack.update_status().is_idle);
    }

    #[test]
    fn test_panicking_decoder_fails_the_request() {
        let fixture = fixture_with(ConflictResolution::PreferArchive, |info| {
            info.decompressor = Some(Arc::new(|_: &CompressionInfo, _: &[u8], _: &mut [u8]| -> bool {
                panic!("decoder bug")
            }));
        });
        for max_jobs in [0, 1] {
            let mut stack = stack(fixture.bus.clone(), max_jobs);
            let request = submit(&mut stack, &fixture.virtual_path, 0, 10);
            run_until_done(&mut stack, &request);
            assert_eq!(request.failure_reason(), Some(FailureReason::CorruptData));
            assert!(stack.update_status().is_idle);
        }
    }
}
