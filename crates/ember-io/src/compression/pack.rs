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

//! Pack archives: many files stored in one, optionally LZ4 compressed.
//!
//! Layout: a 24-byte header (`EPAK`, `u32` version, `u64` manifest offset,
//! `u64` manifest length, all big-endian), the entry payloads, then the
//! bincode-encoded [`PackManifest`]. Compressed payloads are complete LZ4
//! streams, `VCS` header included.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use ember_core::io::{CompressionInfo, CompressionTag, ConflictResolution, RequestPath};
use serde::{Deserialize, Serialize};

use super::bus::CompressionProvider;
use super::compressor::CompressorRegistry;
use super::header::MAX_EXPANSION_RATIO;
use super::lz4::{lz4_decompression_func, Lz4Compressor, LZ4_COMPRESSOR_ID};
use crate::error::{StreamError, StreamResult};
use crate::stream::{ByteStream, FileStream, OpenMode};

const PACK_MAGIC: [u8; 4] = *b"EPAK";
const PACK_VERSION: u32 = 1;
const PACK_HEADER_SIZE: usize = 24;

/// One file inside a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    /// Normalised path relative to the pack's mount point.
    pub path: String,
    /// Offset of the payload in the archive.
    pub offset: u64,
    /// Bytes the payload occupies in the archive.
    pub stored_size: u64,
    /// Size of the original file.
    pub uncompressed_size: u64,
    /// Codec of the payload, [`CompressionTag::NONE`] when stored as-is.
    pub compression: CompressionTag,
}

impl PackEntry {
    /// Returns `true` if the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionTag::NONE
    }
}

/// The table of contents of a pack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    /// All entries, in the order they were written.
    pub entries: Vec<PackEntry>,
}

fn entry_key(path: &str) -> StreamResult<String> {
    let trimmed = path.trim_start_matches(['/', '\\']);
    let key = RequestPath::from_absolute(trimmed).absolute_path().to_owned();
    if key.is_empty() {
        return Err(StreamError::Archive(format!("invalid entry path '{path}'")));
    }
    Ok(key)
}

/// The length of `len` bytes at `offset`, if they lie inside `stream_size` bytes.
fn stored_range(offset: u64, len: u64, stream_size: u64) -> Option<usize> {
    offset.checked_add(len).filter(|&end| end <= stream_size)?;
    usize::try_from(len).ok()
}

/// Writes a pack archive.
pub struct PackWriter {
    stream: FileStream,
    manifest: PackManifest,
    paths: HashSet<String>,
    next_offset: u64,
    compressor: Lz4Compressor,
}

impl PackWriter {
    /// Creates (or truncates) the archive at `path`.
    pub fn create(path: impl AsRef<Path>) -> StreamResult<Self> {
        let mut stream = FileStream::open(path.as_ref(), OpenMode::Write)?;
        stream.write_at(0, &[0u8; PACK_HEADER_SIZE])?;
        Ok(Self {
            stream,
            manifest: PackManifest::default(),
            paths: HashSet::new(),
            next_offset: PACK_HEADER_SIZE as u64,
            compressor: Lz4Compressor::default(),
        })
    }

    /// Adds a file. With `compress`, the payload is LZ4 compressed unless that
    /// does not make it smaller.
    pub fn add_entry(&mut self, path: &str, data: &[u8], compress: bool) -> StreamResult<()> {
        let key = entry_key(path)?;
        if !self.paths.insert(key.clone()) {
            return Err(StreamError::Archive(format!("duplicate entry '{key}'")));
        }

        let compressed = if compress {
            Some(self.compressor.compress_to_vec(data)?)
                .filter(|compressed| compressed.len() < data.len())
        } else {
            None
        };
        let (payload, compression) = match &compressed {
            Some(compressed) => (compressed.as_slice(), LZ4_COMPRESSOR_ID),
            None => (data, CompressionTag::NONE),
        };

        self.stream.write_at(self.next_offset, payload)?;
        log::debug!(
            "Packed '{key}': {} bytes stored as {} ({compression})",
            data.len(),
            payload.len()
        );
        self.manifest.entries.push(PackEntry {
            path: key,
            offset: self.next_offset,
            stored_size: payload.len() as u64,
            uncompressed_size: data.len() as u64,
            compression,
        });
        self.next_offset += payload.len() as u64;
        Ok(())
    }

    /// Writes the manifest and the header and closes the archive.
    pub fn finish(mut self) -> StreamResult<PackManifest> {
        let config = bincode::config::standard();
        let manifest_bytes = bincode::serde::encode_to_vec(&self.manifest, config)?;
        self.stream.write_at(self.next_offset, &manifest_bytes)?;

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[..4].copy_from_slice(&PACK_MAGIC);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..16].copy_from_slice(&self.next_offset.to_be_bytes());
        header[16..].copy_from_slice(&(manifest_bytes.len() as u64).to_be_bytes());
        self.stream.write_at(0, &header)?;
        self.stream.flush()?;
        self.stream.close();

        log::info!(
            "Wrote pack {} with {} entries",
            self.stream.path().display(),
            self.manifest.entries.len()
        );
        Ok(self.manifest)
    }
}

/// A pack mounted under a directory, answering lookups for the files it holds.
pub struct PackArchive {
    archive: RequestPath,
    mount_point: String,
    entries: HashMap<String, PackEntry>,
    conflict_resolution: ConflictResolution,
}

impl PackArchive {
    /// Loads the manifest of `archive` and mounts its entries under `mount_point`.
    pub fn open(archive: RequestPath, mount_point: &RequestPath) -> StreamResult<Self> {
        if !archive.is_valid() || !mount_point.is_valid() {
            return Err(StreamError::Archive(format!(
                "cannot mount '{}' at '{}'",
                archive.as_stored(),
                mount_point.as_stored()
            )));
        }

        let mut stream = FileStream::open(archive.absolute_path(), OpenMode::Read)?;
        let mut header = [0u8; PACK_HEADER_SIZE];
        if stream.read_at(0, &mut header)? != PACK_HEADER_SIZE || header[..4] != PACK_MAGIC {
            return Err(StreamError::Archive(format!(
                "'{}' is not a pack",
                archive.absolute_path()
            )));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PACK_VERSION {
            return Err(StreamError::Archive(format!(
                "unsupported pack version {version}"
            )));
        }
        let mut field = [0u8; 8];
        field.copy_from_slice(&header[8..16]);
        let manifest_offset = u64::from_be_bytes(field);
        field.copy_from_slice(&header[16..24]);
        let manifest_len = stored_range(manifest_offset, u64::from_be_bytes(field), stream.size()?)
            .ok_or_else(|| StreamError::Archive("manifest is truncated".into()))?;

        let mut manifest_bytes = vec![0u8; manifest_len];
        if stream.read_at(manifest_offset, &mut manifest_bytes)? != manifest_len {
            return Err(StreamError::Archive("manifest is truncated".into()));
        }
        let config = bincode::config::standard();
        let (manifest, _): (PackManifest, _) =
            bincode::serde::decode_from_slice(&manifest_bytes, config)?;

        let entries: HashMap<_, _> = manifest
            .entries
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        log::info!(
            "Mounted pack '{}' ({} entries) at '{}'",
            archive.absolute_path(),
            entries.len(),
            mount_point.absolute_path()
        );

        Ok(Self {
            archive,
            mount_point: mount_point.absolute_path().to_owned(),
            entries,
            conflict_resolution: ConflictResolution::default(),
        })
    }

    /// Sets how loose files with the same path are treated.
    pub fn with_conflict_resolution(mut self, conflict_resolution: ConflictResolution) -> Self {
        self.conflict_resolution = conflict_resolution;
        self
    }

    /// The archive file.
    pub fn archive(&self) -> &RequestPath {
        &self.archive
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the pack holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_for<'a>(&self, absolute: &'a str) -> Option<&'a str> {
        let rest = absolute.strip_prefix(self.mount_point.as_str())?;
        if self.mount_point.ends_with('/') {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Looks up the entry for an absolute path below the mount point.
    pub fn entry(&self, path: &RequestPath) -> Option<&PackEntry> {
        self.entries.get(self.key_for(path.absolute_path())?)
    }

    /// Reads and decompresses an entry synchronously.
    pub fn read_entry(
        &self,
        path: &RequestPath,
        registry: &CompressorRegistry,
    ) -> StreamResult<Vec<u8>> {
        let entry = self.entry(path).ok_or_else(|| {
            StreamError::Archive(format!("'{}' is not in this pack", path.absolute_path()))
        })?;

        let mut stream = FileStream::open(self.archive.absolute_path(), OpenMode::Read)?;
        let truncated = || StreamError::Archive(format!("entry '{}' is truncated", entry.path));
        let stored_len =
            stored_range(entry.offset, entry.stored_size, stream.size()?).ok_or_else(truncated)?;
        let mut stored = vec![0u8; stored_len];
        if stream.read_at(entry.offset, &mut stored)? != stored.len() {
            return Err(truncated());
        }
        if !entry.is_compressed() {
            return Ok(stored);
        }

        let uncompressed_len = Some(entry.uncompressed_size)
            .filter(|&size| size <= entry.stored_size.saturating_mul(MAX_EXPANSION_RATIO))
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| {
                StreamError::Archive(format!(
                    "entry '{}' announces {} bytes from {} stored bytes",
                    entry.path, entry.uncompressed_size, entry.stored_size
                ))
            })?;
        let mut output = vec![0u8; uncompressed_len];
        registry.decompress_buffer(&stored, &mut output)?;
        Ok(output)
    }
}

impl CompressionProvider for PackArchive {
    fn name(&self) -> &str {
        self.archive.absolute_path()
    }

    fn find_compression_info(&self, path: &RequestPath) -> Option<CompressionInfo> {
        let entry = self.entry(path)?;
        let is_compressed = entry.is_compressed();
        Some(CompressionInfo {
            archive_filename: self.archive.clone(),
            decompressor: is_compressed.then(lz4_decompression_func),
            compression_tag: entry.compression,
            offset: entry.offset,
            compressed_size: entry.stored_size,
            uncompressed_size: entry.uncompressed_size,
            conflict_resolution: self.conflict_resolution,
            is_compressed,
            is_shared_pak: true,
        })
    }
}

impl fmt::Debug for PackArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackArchive")
            .field("archive", &self.archive.absolute_path())
            .field("mount_point", &self.mount_point)
            .field("entries", &self.entries.len())
            .finish()
    }
}
