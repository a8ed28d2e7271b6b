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

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ember_core::io::{RequestPath, RequestStatus};
use ember_core::memory::{AllocationSource, AllocatorRegistry, AllocatorTag};
use ember_data::allocators::{DefaultRequestMemoryAllocator, OsAllocator, TrackingSource};
use ember_io::compression::{CompressionBus, PackArchive, PackWriter};
use ember_io::{RequestHandle, Streamer, StreamerConfig};

struct StreamingBuffers;

impl AllocatorTag for StreamingBuffers {
    const NAME: &'static str = "StreamingBuffers";
}

const TIMEOUT: Duration = Duration::from_secs(30);

fn wait(handle: &RequestHandle, what: &str) -> Result<()> {
    match handle.wait_timeout(TIMEOUT) {
        Some(RequestStatus::Completed) => Ok(()),
        Some(status) => bail!(
            "{what}: request ended as {status} ({})",
            handle
                .failure_reason()
                .map_or_else(|| "no reason".to_string(), |reason| reason.to_string())
        ),
        None => bail!("{what}: timed out"),
    }
}

/// Writes a few loose files and a pack into `root`.
fn build_content(root: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    fs::create_dir_all(root.join("loose"))?;
    let level: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("loose/level.bin"), &level)?;

    let script = b"print('hello from the pack')\n".repeat(2_000);
    let mut writer = PackWriter::create(root.join("content.pak"))?;
    writer.add_entry("scripts/main.lua", &script, true)?;
    writer.add_entry("scripts/tiny.lua", b"return 1", true)?;
    let manifest = writer.finish()?;
    log::info!("Built pack with {} entries", manifest.entries.len());
    Ok((level, script))
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let root = std::env::temp_dir().join("ember-sandbox");
    let (level, script) = build_content(&root).context("building sandbox content")?;

    let mut config = match std::env::args().nth(1) {
        Some(path) => StreamerConfig::from_file(&path)
            .with_context(|| format!("loading streamer config from {path}"))?,
        None => StreamerConfig::default(),
    };
    config.aliases.insert(
        "game".into(),
        root.join("loose").to_string_lossy().into_owned(),
    );
    config.aliases.insert(
        "content".into(),
        root.join("mounted").to_string_lossy().into_owned(),
    );
    log::debug!("Streamer configuration:\n{}", config.to_ron()?);

    let bus = Arc::new(CompressionBus::new());
    let mut streamer = Streamer::new(&config, bus.clone())?;
    let pack = PackArchive::open(
        RequestPath::from_absolute(root.join("content.pak").to_string_lossy()),
        &streamer.path("@content@"),
    )?;
    bus.connect(Arc::new(pack));

    let mut registry = AllocatorRegistry::new();
    let tracked = registry.register::<StreamingBuffers>(
        Arc::new(TrackingSource::new(Arc::new(OsAllocator::default()))),
        "request buffers of the sandbox",
    )?;
    let allocator = Arc::new(DefaultRequestMemoryAllocator::new(
        tracked.clone(),
        streamer.recommendations(),
    ));

    let started = Instant::now();
    let whole = streamer.read_file(streamer.path("@game@/level.bin"));
    let chunk = streamer.read_with_allocator(
        streamer.path("@game@/level.bin"),
        70_000,
        4_000,
        allocator.clone(),
    );
    let lua = streamer.read_file(streamer.path("@content@/scripts/main.lua"));
    let exists = streamer.file_exists(streamer.path("@game@/missing.bin"));
    let size = streamer.file_size(streamer.path("@game@/level.bin"));

    wait(&whole, "level.bin")?;
    wait(&chunk, "level.bin chunk")?;
    wait(&lua, "main.lua")?;
    wait(&exists, "missing.bin check")?;
    wait(&size, "level.bin size")?;
    log::info!("Streamed everything in {:.2?}", started.elapsed());

    let whole_data = whole.take_read_output().context("level.bin output")?;
    let chunk_data = chunk.take_read_output().context("chunk output")?;
    let lua_data = lua.take_read_output().context("main.lua output")?;
    if whole_data.data() != level.as_slice()
        || chunk_data.data() != &level[70_000..74_000]
        || lua_data.data() != script.as_slice()
    {
        bail!("streamed data does not match what was written");
    }
    log::info!(
        "level.bin: {} bytes (size query: {:?}), chunk padding {} bytes, missing.bin exists: {:?}",
        whole_data.len(),
        size.file_size(),
        chunk_data.padding(),
        exists.file_exists()
    );
    if let Some(stats) = tracked.stats() {
        log::info!(
            "StreamingBuffers: {} bytes in use, peak {}",
            stats.current_allocated_bytes,
            stats.peak_allocated_bytes
        );
    }
    drop(chunk_data);

    // A second pass is served from the block cache.
    let again = streamer.read(streamer.path("@game@/level.bin"), 1_024, 8_192, Vec::new());
    wait(&again, "level.bin again")?;

    for statistic in streamer.collect_statistics() {
        log::info!("{statistic}");
    }
    streamer.shutdown();
    fs::remove_dir_all(&root).ok();
    Ok(())
}
