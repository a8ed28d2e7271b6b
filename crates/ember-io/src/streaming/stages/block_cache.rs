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

//! Keeps recently read file blocks in memory.

use std::mem;

use ahash::AHashMap;
use ember_core::io::{Recommendations, RequestStatus};

use crate::config::BlockCacheConfig;
use crate::streaming::{
    AverageWindow, FailureReason, FileRequestPtr, Next, NextRef, ReadRequestData, RequestCommand,
    Statistic, StreamStackEntry, READ_TO_END,
};

type BlockKey = (u64, u64);

#[derive(Default)]
struct CacheSlot {
    key: Option<BlockKey>,
    data: Vec<u8>,
    file_size: u64,
    last_used: u64,
}

enum Lookup {
    Hit(Result<(), FailureReason>),
    Miss,
    Forward,
}

/// Serves reads from a fixed pool of cached blocks.
///
/// A read whose every block is cached is completed here. Anything else goes
/// down the stack unchanged; once it completes, the blocks its buffer fully
/// covers are copied into the pool, evicting the least recently used ones.
/// The last block of a file may be shorter than the block size.
pub struct BlockCacheStage {
    block_size: u64,
    recommendations: Recommendations,
    slots: Vec<CacheSlot>,
    index: AHashMap<BlockKey, usize>,
    clock: u64,
    watching: Vec<FileRequestPtr>,
    hits: u64,
    misses: u64,
    hit_rate: AverageWindow,
}

impl BlockCacheStage {
    pub fn new(config: &BlockCacheConfig, recommendations: Recommendations) -> Self {
        Self {
            block_size: config.block_size.max(1),
            recommendations,
            slots: (0..config.block_count).map(|_| CacheSlot::default()).collect(),
            index: AHashMap::with_capacity(config.block_count),
            clock: 0,
            watching: Vec::new(),
            hits: 0,
            misses: 0,
            hit_rate: AverageWindow::default(),
        }
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.index.len()
    }

    fn lookup(&mut self, read: &mut ReadRequestData) -> Lookup {
        if !read.path.is_valid() || self.slots.is_empty() {
            return Lookup::Forward;
        }
        let hash = read.path.path_hash();
        let bs = self.block_size;

        let size = if read.size == READ_TO_END {
            match self.index.get(&(hash, read.offset / bs)) {
                Some(&slot) => self.slots[slot].file_size.saturating_sub(read.offset),
                None => return Lookup::Miss,
            }
        } else {
            read.size
        };
        let Some(end) = read.offset.checked_add(size) else {
            return Lookup::Forward;
        };
        if size == 0 {
            return Lookup::Forward;
        }

        let first = read.offset / bs;
        let last = (end - 1) / bs;
        if last - first >= self.slots.len() as u64 {
            return Lookup::Miss;
        }
        let mut found = Vec::with_capacity((last - first + 1) as usize);
        for block in first..=last {
            let Some(&slot) = self.index.get(&(hash, block)) else {
                return Lookup::Miss;
            };
            let needed = end.min((block + 1) * bs) - block * bs;
            if (self.slots[slot].data.len() as u64) < needed {
                return Lookup::Miss;
            }
            found.push(slot);
        }

        let Ok(len) = usize::try_from(size) else {
            return Lookup::Miss;
        };
        let recommended = self
            .recommendations
            .calculate_recommended_memory_size(size, 0);
        if let Err(reason) =
            read.output
                .reserve(0, len, recommended, self.recommendations.memory_alignment())
        {
            return Lookup::Hit(Err(reason));
        }

        self.clock += 1;
        let out = read.output.as_mut_slice();
        let mut written = 0;
        let mut file_size = 0;
        for (block, slot) in (first..=last).zip(found) {
            let slot = &mut self.slots[slot];
            slot.last_used = self.clock;
            file_size = slot.file_size;
            let block_start = block * bs;
            let from = (read.offset.max(block_start) - block_start) as usize;
            let to = (end.min(block_start + bs) - block_start) as usize;
            out[written..written + to - from].copy_from_slice(&slot.data[from..to]);
            written += to - from;
        }
        read.size = size;
        read.padding = 0;
        read.file_size = Some(file_size);
        Lookup::Hit(Ok(()))
    }

    fn insert(&mut self, key: BlockKey, bytes: &[u8], file_size: u64) {
        self.clock += 1;
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let victim = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| (slot.key.is_some(), slot.last_used))
                    .map(|(index, _)| index);
                let Some(victim) = victim else {
                    return;
                };
                if let Some(old) = self.slots[victim].key.take() {
                    self.index.remove(&old);
                }
                self.index.insert(key, victim);
                victim
            }
        };
        let slot = &mut self.slots[slot];
        slot.key = Some(key);
        slot.data.clear();
        slot.data.extend_from_slice(bytes);
        slot.file_size = file_size;
        slot.last_used = self.clock;
    }

    fn populate_from(&mut self, request: &FileRequestPtr) {
        let command = request.command();
        let RequestCommand::Read(read) = &*command else {
            return;
        };
        let Some(file_size) = read.file_size else {
            return;
        };
        let bs = self.block_size;
        let hash = read.path.path_hash();
        let start = read.buffer_file_offset();
        let buffer = read.output.as_slice();
        let valid_end = (start + buffer.len() as u64)
            .min(file_size)
            .min(read.offset.saturating_add(read.size));

        let mut block = start.div_ceil(bs);
        loop {
            let block_start = block * bs;
            let block_end = (block_start + bs).min(file_size);
            if block_start >= valid_end || block_end > valid_end {
                break;
            }
            let bytes = &buffer[(block_start - start) as usize..(block_end - start) as usize];
            self.insert((hash, block), bytes, file_size);
            block += 1;
        }
    }

    /// Copies blocks out of reads that finished since the last call.
    fn populate_from_finished_reads(&mut self) {
        for request in mem::take(&mut self.watching) {
            match request.status() {
                RequestStatus::Completed => self.populate_from(&request),
                status if status.is_terminal() => {}
                _ => self.watching.push(request),
            }
        }
    }

    fn evict_file(&mut self, hash: u64) {
        for slot in &mut self.slots {
            if matches!(slot.key, Some((file, _)) if file == hash) {
                if let Some(key) = slot.key.take() {
                    self.index.remove(&key);
                }
                slot.data.clear();
            }
        }
    }

    fn evict_all(&mut self) {
        for slot in &mut self.slots {
            slot.key = None;
            slot.data.clear();
        }
        self.index.clear();
    }
}

impl StreamStackEntry for BlockCacheStage {
    fn name(&self) -> &str {
        "BlockCache"
    }

    fn queue_request(&mut self, request: FileRequestPtr, next: Next<'_>) {
        let lookup = {
            let mut command = request.command();
            match &mut *command {
                RequestCommand::Read(read) => self.lookup(read),
                RequestCommand::Flush { path } => {
                    self.evict_file(path.path_hash());
                    Lookup::Forward
                }
                RequestCommand::FlushAll => {
                    self.evict_all();
                    Lookup::Forward
                }
                _ => Lookup::Forward,
            }
        };
        match lookup {
            Lookup::Hit(result) => {
                self.hits += 1;
                self.hit_rate.push(1.0);
                match result {
                    Ok(()) => request.complete(),
                    Err(reason) => request.fail(reason),
                }
                log::trace!("BlockCache: served request {} from memory", request.id());
                next.context().mark_request_as_completed(request);
            }
            Lookup::Miss => {
                self.misses += 1;
                self.hit_rate.push(0.0);
                self.watching.push(request.clone());
                next.queue_request(request);
            }
            Lookup::Forward => next.queue_request(request),
        }
    }

    fn execute_requests(&mut self, next: Next<'_>) -> bool {
        self.populate_from_finished_reads();
        next.execute_requests()
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>, next: NextRef<'_>) {
        let name = self.name();
        statistics.push(Statistic::new(name, "hit_rate", self.hit_rate.average()));
        statistics.push(Statistic::new(name, "hits", self.hits as f64));
        statistics.push(Statistic::new(name, "misses", self.misses as f64));
        statistics.push(Statistic::new(name, "cached_blocks", self.cached_blocks() as f64));
        next.collect_statistics(statistics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, StorageDriveConfig};
    use crate::streaming::stages::StorageDriveStage;
    use crate::streaming::{ReadBuffer, StreamStack, StreamerContext};
    use ember_core::io::RequestPath;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn stack(block_size: u64, block_count: usize) -> StreamStack {
        let recommendations = Recommendations::new(16, 512);
        StreamStack::new(StreamerContext::new())
            .with_stage(BlockCacheStage::new(
                &BlockCacheConfig {
                    block_size,
                    block_count,
                },
                recommendations,
            ))
            .with_stage(StorageDriveStage::new(
                &StorageDriveConfig::default(),
                &RetryConfig::default(),
                recommendations,
            ))
    }

    fn read(stack: &mut StreamStack, path: &Path, offset: u64, size: u64) -> FileRequestPtr {
        let request = stack
            .context()
            .create_request(RequestCommand::Read(ReadRequestData::new(
                RequestPath::from_absolute(path.to_string_lossy()),
                offset,
                size,
                ReadBuffer::default(),
            )));
        stack.queue_request(request.clone());
        while stack.execute_requests() {}
        request
    }

    fn data(request: &FileRequestPtr) -> Vec<u8> {
        match &*request.command() {
            RequestCommand::Read(read) => read.data().to_vec(),
            _ => unreachable!(),
        }
    }

    fn statistic(stack: &StreamStack, name: &str) -> f64 {
        stack
            .collect_statistics()
            .into_iter()
            .find(|statistic| statistic.owner == "BlockCache" && statistic.name == name)
            .map(|statistic| statistic.value)
            .unwrap()
    }

    #[test]
    fn test_whole_file_read_fills_the_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let bytes: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        fs::write(&path, &bytes).unwrap();
        let mut stack = stack(256, 8);

        let whole = read(&mut stack, &path, 0, READ_TO_END);
        assert_eq!(data(&whole), bytes);
        assert_eq!(statistic(&stack, "misses"), 1.0);
        assert_eq!(statistic(&stack, "cached_blocks"), 4.0);

        let part = read(&mut stack, &path, 200, 700);
        assert_eq!(part.status(), RequestStatus::Completed);
        assert_eq!(data(&part), &bytes[200..900]);
        assert_eq!(statistic(&stack, "hits"), 1.0);

        let tail = read(&mut stack, &path, 900, READ_TO_END);
        assert_eq!(data(&tail), &bytes[900..]);
        assert_eq!(statistic(&stack, "hits"), 2.0);
    }

    #[test]
    fn test_partial_blocks_are_not_cached() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, [3u8; 1024]).unwrap();
        let mut stack = stack(256, 8);

        read(&mut stack, &path, 10, 300);
        // Only [256, 310) of block 1 was read; nothing is fully covered.
        assert_eq!(statistic(&stack, "cached_blocks"), 0.0);

        read(&mut stack, &path, 256, 256);
        assert_eq!(statistic(&stack, "cached_blocks"), 1.0);
    }

    #[test]
    fn test_least_recently_used_block_is_evicted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, [9u8; 768]).unwrap();
        let mut stack = stack(256, 2);

        read(&mut stack, &path, 0, 256);
        read(&mut stack, &path, 256, 256);
        // Touch block 0 so block 1 becomes the oldest.
        read(&mut stack, &path, 0, 16);
        read(&mut stack, &path, 512, 256);
        assert_eq!(statistic(&stack, "cached_blocks"), 2.0);

        let hits = statistic(&stack, "hits");
        read(&mut stack, &path, 0, 256);
        assert_eq!(statistic(&stack, "hits"), hits + 1.0);
        read(&mut stack, &path, 256, 256);
        assert_eq!(statistic(&stack, "hits"), hits + 1.0);
    }

    #[test]
    fn test_flush_evicts_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, [1u8; 512]).unwrap();
        let mut stack = stack(256, 4);

        read(&mut stack, &path, 0, READ_TO_END);
        assert_eq!(statistic(&stack, "cached_blocks"), 2.0);

        let flush = stack.context().create_request(RequestCommand::Flush {
            path: RequestPath::from_absolute(path.to_string_lossy()),
        });
        stack.queue_request(flush.clone());
        while stack.execute_requests() {}
        assert_eq!(flush.status(), RequestStatus::Completed);
        assert_eq!(statistic(&stack, "cached_blocks"), 0.0);
    }
}
