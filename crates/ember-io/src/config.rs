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

//! Configuration of the streamer and its default stages.

use std::collections::BTreeMap;
use std::path::Path;

use ember_core::io::{PathAliases, Recommendations};
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Settings of the block cache stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Size in bytes of one cached block.
    pub block_size: u64,
    /// Number of blocks in the pool. `0` disables the stage.
    pub block_count: usize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            block_count: 32,
        }
    }
}

/// Settings of the storage drive stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageDriveConfig {
    /// Maximum number of file handles kept open at once.
    pub max_file_handles: usize,
    /// Maximum number of requests served per call to `execute_requests`.
    pub max_requests_per_tick: usize,
    /// Request slots reported beyond what the drive is working on, so the
    /// next requests are already queued when the current ones finish.
    pub overcommit: usize,
}

impl Default for StorageDriveConfig {
    fn default() -> Self {
        Self {
            max_file_handles: 32,
            max_requests_per_tick: 4,
            overcommit: 2,
        }
    }
}

/// Settings of the decompression stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompressionConfig {
    /// Number of decompression worker threads.
    pub max_jobs: usize,
    /// Compressed plus uncompressed bytes the stage may hold before it stops
    /// accepting new work.
    pub max_buffered_bytes: u64,
}

impl Default for DecompressionConfig {
    fn default() -> Self {
        Self {
            max_jobs: 2,
            max_buffered_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Bounded retry used when (re)opening streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How many times to try opening a stream.
    pub attempts: u32,
    /// Delay between two attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 10,
        }
    }
}

/// Configuration of a [`Streamer`](crate::streaming::Streamer).
///
/// Usually loaded from a RON file:
///
/// ```ron
/// (
///     memory_alignment: 4096,
///     size_alignment: 512,
///     block_cache: (block_size: 65536, block_count: 16),
///     aliases: { "assets": "/game/assets" },
/// )
/// ```
///
/// Missing fields take their default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Alignment of request buffer addresses.
    pub memory_alignment: usize,
    /// Granularity request buffer sizes are rounded to.
    pub size_alignment: u64,
    /// Block cache stage settings.
    pub block_cache: BlockCacheConfig,
    /// Storage drive stage settings.
    pub storage_drive: StorageDriveConfig,
    /// Decompression stage settings.
    pub decompression: DecompressionConfig,
    /// Retry policy for opening streams.
    pub retry: RetryConfig,
    /// Path aliases, by name (without the `@` markers) to root directory.
    pub aliases: BTreeMap<String, String>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            memory_alignment: 4096,
            size_alignment: 512,
            block_cache: BlockCacheConfig::default(),
            storage_drive: StorageDriveConfig::default(),
            decompression: DecompressionConfig::default(),
            retry: RetryConfig::default(),
            aliases: BTreeMap::new(),
        }
    }
}

impl StreamerConfig {
    /// Parses and validates a configuration from RON text.
    pub fn from_ron(text: &str) -> StreamResult<Self> {
        let config: Self = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading streamer configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Serializes the configuration to pretty RON.
    pub fn to_ron(&self) -> StreamResult<String> {
        let pretty_config = ron::ser::PrettyConfig::default().indentor("  ".to_string());
        Ok(ron::ser::to_string_pretty(self, pretty_config)?)
    }

    /// Checks the invariants the stages rely on.
    pub fn validate(&self) -> StreamResult<()> {
        if !self.memory_alignment.is_power_of_two() {
            return Err(StreamError::Config(format!(
                "memory_alignment must be a power of two, got {}",
                self.memory_alignment
            )));
        }
        if !self.size_alignment.is_power_of_two() {
            return Err(StreamError::Config(format!(
                "size_alignment must be a power of two, got {}",
                self.size_alignment
            )));
        }
        if self.block_cache.block_count > 0 && self.block_cache.block_size == 0 {
            return Err(StreamError::Config("block_size must be non-zero".into()));
        }
        if self.storage_drive.max_file_handles == 0 || self.storage_drive.max_requests_per_tick == 0
        {
            return Err(StreamError::Config(
                "storage_drive needs at least one file handle and one request per tick".into(),
            ));
        }
        Ok(())
    }

    /// The buffer alignment policy.
    ///
    /// # Panics
    ///
    /// Panics if the alignments are not powers of two; [`validate`](Self::validate)
    /// rejects such configurations.
    pub fn recommendations(&self) -> Recommendations {
        Recommendations::new(self.memory_alignment, self.size_alignment)
    }

    /// Builds the alias table.
    pub fn path_aliases(&self) -> StreamResult<PathAliases> {
        let mut aliases = PathAliases::new();
        for (name, root) in &self.aliases {
            aliases.set(name, root)?;
        }
        Ok(aliases)
    }
}
