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

use anyhow::Result;
use ember_core::io::{RequestPath, RequestStatus};
use ember_io::compression::{CompressionBus, PackArchive, PackWriter};
use ember_io::streaming::stages::StorageDriveStage;
use ember_io::streaming::{
    FailureReason, FileRequest, FileRequestPtr, Next, ReadBuffer, ReadRequestData,
    RequestCommand, Statistic, StreamStackEntry,
};
use ember_io::{Streamer, StreamerConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A stage that only forwards.
struct PassThrough;

impl StreamStackEntry for PassThrough {
    fn name(&self) -> &str {
        "PassThrough"
    }
}

/// Holds queued requests until released.
struct Gate {
    open: Arc<AtomicBool>,
    held: Vec<FileRequestPtr>,
}

impl StreamStackEntry for Gate {
    fn name(&self) -> &str {
        "Gate"
    }

    fn queue_request(&mut self, request: FileRequestPtr, _next: Next<'_>) {
        self.held.push(request);
    }

    fn execute_requests(&mut self, mut next: Next<'_>) -> bool {
        if self.open.load(Ordering::SeqCst) && !self.held.is_empty() {
            for request in self.held.drain(..) {
                next.by_ref().queue_request(request);
            }
            return true;
        }
        next.execute_requests()
    }
}

fn statistic(statistics: &[Statistic], owner: &str, name: &str) -> f64 {
    statistics
        .iter()
        .find(|statistic| statistic.owner == owner && statistic.name == name)
        .map(|statistic| statistic.value)
        .unwrap_or_else(|| panic!("missing statistic {owner}.{name}"))
}

#[test]
fn test_unhandled_request_is_completed_exactly_once() -> Result<()> {
    let stages: Vec<Box<dyn StreamStackEntry>> =
        vec![Box::new(PassThrough), Box::new(PassThrough), Box::new(PassThrough)];
    let streamer = Streamer::with_stages(&StreamerConfig::default(), stages)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = streamer.submit(
        RequestCommand::Read(ReadRequestData::new(
            RequestPath::from_absolute("/does/not/matter.bin"),
            0,
            64,
            ReadBuffer::default(),
        )),
        Some(Box::new(move |_: &FileRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    assert_eq!(handle.wait_timeout(TIMEOUT), Some(RequestStatus::Failed));
    assert_eq!(handle.failure_reason(), Some(FailureReason::Unhandled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(streamer.context().failed_total(), 1);
    assert_eq!(streamer.context().completed_total(), 0);

    // Flushes complete even when nobody handles them.
    let flush = streamer.flush_all();
    assert_eq!(flush.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    Ok(())
}

#[test]
fn test_allocator_read_through_default_stack() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("level.bin");
    let bytes: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(&path, &bytes)?;

    let streamer = Streamer::new(&StreamerConfig::default(), Arc::new(CompressionBus::new()))?;
    let allocator = streamer.create_request_allocator();
    let handle = streamer.read_with_allocator(
        RequestPath::from_absolute(path.to_string_lossy()),
        10,
        100,
        allocator.clone(),
    );
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));

    let output = handle.take_read_output().expect("read output");
    assert_eq!(output.data(), &bytes[10..110]);
    assert_eq!(output.padding(), 10);
    match output.buffer() {
        ReadBuffer::Allocated { buffer, .. } => assert_eq!(buffer.allocation().size, 512),
        other => panic!("expected an allocated buffer, got {other:?}"),
    }
    assert_eq!(allocator.outstanding_allocations(), 1);

    drop(output);
    drop(handle);
    assert_eq!(allocator.outstanding_allocations(), 0);
    Ok(())
}

#[test]
fn test_repeated_reads_hit_the_block_cache() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cached.bin");
    let bytes = vec![0x5a_u8; 3 * 65_536 + 100];
    std::fs::write(&path, &bytes)?;
    let path = RequestPath::from_absolute(path.to_string_lossy());

    let streamer = Streamer::new(&StreamerConfig::default(), Arc::new(CompressionBus::new()))?;
    let whole = streamer.read_file(path.clone());
    assert_eq!(whole.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    assert_eq!(whole.take_read_output().unwrap().data(), bytes.as_slice());
    assert_eq!(whole.file_size(), Some(bytes.len() as u64));

    let part = streamer.read(path.clone(), 65_000, 1_000, Vec::new());
    assert_eq!(part.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    assert_eq!(part.take_read_output().unwrap().data(), &bytes[65_000..66_000]);

    let statistics = streamer.collect_statistics();
    assert_eq!(statistic(&statistics, "BlockCache", "hits"), 1.0);
    assert_eq!(statistic(&statistics, "BlockCache", "cached_blocks"), 4.0);
    assert_eq!(statistic(&statistics, "Streamer", "completed_requests"), 2.0);

    let flush = streamer.flush(path);
    assert_eq!(flush.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    let statistics = streamer.collect_statistics();
    assert_eq!(statistic(&statistics, "BlockCache", "cached_blocks"), 0.0);
    Ok(())
}

#[test]
fn test_pack_entries_stream_through_decompression() -> Result<()> {
    let dir = tempdir()?;
    let pack_path = dir.path().join("assets.pak");
    let mount = dir.path().join("assets");
    let text = b"streaming compressed entries ".repeat(4_000);
    let header = b"raw header bytes".to_vec();

    let mut writer = PackWriter::create(&pack_path)?;
    writer.add_entry("text/readme.txt", &text, true)?;
    writer.add_entry("bin/header.dat", &header, false)?;
    writer.finish()?;

    let mut config = StreamerConfig::default();
    config
        .aliases
        .insert("assets".into(), mount.to_string_lossy().into_owned());
    let bus = Arc::new(CompressionBus::new());
    let streamer = Streamer::new(&config, bus.clone())?;

    let pack = PackArchive::open(
        RequestPath::from_absolute(pack_path.to_string_lossy()),
        &RequestPath::from_absolute(mount.to_string_lossy()),
    )?;
    bus.connect(Arc::new(pack));

    let readme = streamer.read_file(streamer.path("@assets@/text/readme.txt"));
    assert_eq!(readme.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    assert_eq!(readme.take_read_output().unwrap().data(), text.as_slice());

    let window = streamer.read(
        streamer.path("@assets@/text/readme.txt"),
        1_000,
        2_900,
        Vec::new(),
    );
    assert_eq!(window.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    assert_eq!(window.take_read_output().unwrap().data(), &text[1_000..3_900]);

    let stored = streamer.read(streamer.path("@assets@/bin/header.dat"), 4, 6, Vec::new());
    assert_eq!(stored.wait_timeout(TIMEOUT), Some(RequestStatus::Completed));
    assert_eq!(stored.take_read_output().unwrap().data(), b"header");

    let past_end = streamer.read(
        streamer.path("@assets@/bin/header.dat"),
        10,
        10,
        Vec::new(),
    );
    assert_eq!(past_end.wait_timeout(TIMEOUT), Some(RequestStatus::Failed));
    assert_eq!(past_end.failure_reason(), Some(FailureReason::ReadPastEnd));

    let statistics = streamer.collect_statistics();
    assert!(statistic(&statistics, "Decompression", "compression_ratio") < 1.0);
    Ok(())
}

#[test]
fn test_file_queries() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("present.txt");
    std::fs::write(&path, b"12345")?;
    let present = RequestPath::from_absolute(path.to_string_lossy());
    let missing = RequestPath::from_absolute(dir.path().join("absent.txt").to_string_lossy());

    let streamer = Streamer::new(&StreamerConfig::default(), Arc::new(CompressionBus::new()))?;
    let exists = streamer.file_exists(present.clone());
    let absent = streamer.file_exists(missing.clone());
    let size = streamer.file_size(present);
    let no_size = streamer.file_size(missing.clone());
    let no_read = streamer.read_file(missing);

    for handle in [&exists, &absent, &size, &no_size, &no_read] {
        assert!(handle.wait_timeout(TIMEOUT).is_some());
    }
    assert_eq!(exists.file_exists(), Some(true));
    assert_eq!(absent.file_exists(), Some(false));
    assert_eq!(size.file_size(), Some(5));
    assert_eq!(no_size.failure_reason(), Some(FailureReason::FileNotFound));
    assert_eq!(no_read.failure_reason(), Some(FailureReason::FileNotFound));
    Ok(())
}

#[test]
fn test_cancel_before_execution() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("never_read.bin");
    std::fs::write(&path, [1u8; 32])?;

    let open = Arc::new(AtomicBool::new(false));
    let config = StreamerConfig::default();
    let stages: Vec<Box<dyn StreamStackEntry>> = vec![
        Box::new(Gate {
            open: open.clone(),
            held: Vec::new(),
        }),
        Box::new(StorageDriveStage::new(
            &config.storage_drive,
            &config.retry,
            config.recommendations(),
        )),
    ];
    let streamer = Streamer::with_stages(&config, stages)?;

    let handle = streamer.read_file(RequestPath::from_absolute(path.to_string_lossy()));
    assert_eq!(handle.wait_timeout(Duration::from_millis(100)), None);
    handle.cancel();
    open.store(true, Ordering::SeqCst);

    assert_eq!(handle.wait_timeout(TIMEOUT), Some(RequestStatus::Failed));
    assert_eq!(handle.failure_reason(), Some(FailureReason::Canceled));
    Ok(())
}

#[test]
fn test_shutdown_cancels_unfinished_requests() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let stages: Vec<Box<dyn StreamStackEntry>> = vec![Box::new(Gate {
        open: Arc::new(AtomicBool::new(false)),
        held: Vec::new(),
    })];
    let mut streamer = Streamer::with_stages(&StreamerConfig::default(), stages)?;
    let counter = calls.clone();
    let handle = streamer.submit(
        RequestCommand::FlushAll,
        Some(Box::new(move |_: &FileRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert_eq!(handle.wait_timeout(Duration::from_millis(100)), None);

    streamer.shutdown();
    assert_eq!(handle.wait_timeout(TIMEOUT), Some(RequestStatus::Failed));
    assert_eq!(handle.failure_reason(), Some(FailureReason::Canceled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}
