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

//! Metadata describing compressed entries inside archives.

use super::RequestPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A 4-byte codec identifier, viewable as a `u32` code or as 4 ASCII characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CompressionTag(u32);

impl CompressionTag {
    /// The tag used for entries that are stored without compression.
    pub const NONE: Self = Self(0);

    /// Creates a tag from its numeric code.
    pub const fn from_code(code: u32) -> Self {
        Self(code)
    }

    /// Creates a tag from 4 characters, first character in the most significant byte.
    pub const fn from_chars(chars: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(chars))
    }

    /// The numeric code.
    pub const fn code(self) -> u32 {
        self.0
    }

    /// The 4 characters of the tag.
    pub const fn chars(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for CompressionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars = self.chars();
        if chars.iter().all(|c| c.is_ascii_graphic()) {
            chars.iter().try_for_each(|&c| write!(f, "{}", c as char))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for CompressionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompressionTag({self})")
    }
}

/// How a file that exists both loose on disk and inside an archive is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Use the loose file when it exists.
    PreferFile,
    /// Use the archive entry.
    #[default]
    PreferArchive,
    /// Only ever read from the archive.
    UseArchiveOnly,
}

/// Decompresses one archive entry.
///
/// Receives the entry's description, the compressed bytes as stored in the
/// archive, and a destination buffer of `uncompressed_size` bytes. Returns
/// `true` on success.
pub type DecompressionFunc = Arc<dyn Fn(&CompressionInfo, &[u8], &mut [u8]) -> bool + Send + Sync>;

/// Describes one entry inside an archive.
#[derive(Clone, Default)]
pub struct CompressionInfo {
    /// The archive the entry lives in.
    pub archive_filename: RequestPath,
    /// The function that turns the stored bytes back into the original data.
    pub decompressor: Option<DecompressionFunc>,
    /// Identifies the codec the entry was compressed with.
    pub compression_tag: CompressionTag,
    /// Byte offset of the entry inside the archive.
    pub offset: u64,
    /// Number of bytes the entry occupies inside the archive.
    pub compressed_size: u64,
    /// Number of bytes of the original data.
    pub uncompressed_size: u64,
    /// How a loose file with the same name is treated.
    pub conflict_resolution: ConflictResolution,
    /// Whether the stored bytes are compressed at all.
    pub is_compressed: bool,
    /// Whether the archive is read by several readers concurrently.
    pub is_shared_pak: bool,
}

impl CompressionInfo {
    /// Runs the entry's decompressor. Returns `false` if none is set or it fails.
    pub fn decompress(&self, compressed: &[u8], output: &mut [u8]) -> bool {
        match &self.decompressor {
            Some(decompress) => decompress(self, compressed, output),
            None => false,
        }
    }
}

impl fmt::Debug for CompressionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionInfo")
            .field("archive_filename", &self.archive_filename)
            .field("compression_tag", &self.compression_tag)
            .field("offset", &self.offset)
            .field("compressed_size", &self.compressed_size)
            .field("uncompressed_size", &self.uncompressed_size)
            .field("conflict_resolution", &self.conflict_resolution)
            .field("is_compressed", &self.is_compressed)
            .field("is_shared_pak", &self.is_shared_pak)
            .field("has_decompressor", &self.decompressor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trips_between_views() {
        let tag = CompressionTag::from_chars(*b"LZ4B");
        assert_eq!(tag.chars(), *b"LZ4B");
        assert_eq!(tag.code(), u32::from_be_bytes(*b"LZ4B"));
        assert_eq!(CompressionTag::from_code(tag.code()), tag);
        assert_eq!(tag.to_string(), "LZ4B");
        assert_eq!(CompressionTag::NONE.to_string(), "0x00000000");
    }

    #[test]
    fn test_moved_out_info_is_left_empty() {
        let mut info = CompressionInfo {
            archive_filename: RequestPath::from_absolute("/data/level.pak"),
            decompressor: Some(Arc::new(|_: &CompressionInfo, input: &[u8], out: &mut [u8]| {
                out.copy_from_slice(input);
                true
            })),
            compressed_size: 4,
            uncompressed_size: 4,
            is_compressed: true,
            ..Default::default()
        };

        let taken = std::mem::take(&mut info);
        assert!(info.decompressor.is_none());
        assert!(!info.archive_filename.is_valid());

        let mut out = [0u8; 4];
        assert!(taken.decompress(&[1, 2, 3, 4], &mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(!info.decompress(&[1, 2, 3, 4], &mut out));
    }
}
