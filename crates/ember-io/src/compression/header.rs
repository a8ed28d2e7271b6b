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

//! The fixed header at the start of every compressed stream.
//!
//! Layout (big-endian): `'V' 'C' 'S'`, `u32` compressor id, `u64`
//! uncompressed size. A stream that does not start with the magic bytes is
//! treated as uncompressed.

use ember_core::io::CompressionTag;

use crate::error::{StreamError, StreamResult};

/// The three magic bytes that open a compressed stream.
pub const COMPRESSION_MAGIC: [u8; 3] = *b"VCS";

/// Encoded size of a [`CompressionHeader`].
pub const HEADER_SIZE: usize = 15;

/// Largest uncompressed size accepted per stored byte of a compressed entry.
///
/// LZ4 cannot expand a block by more than 255x, so archive metadata that
/// announces more is corrupt.
pub const MAX_EXPANSION_RATIO: u64 = 255;

/// The decoded header of a compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHeader {
    /// The codec that wrote the stream.
    pub compressor_id: CompressionTag,
    /// Size of the data once decompressed.
    pub uncompressed_size: u64,
}

impl CompressionHeader {
    /// Returns `true` if `bytes` starts with the compression magic.
    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.starts_with(&COMPRESSION_MAGIC)
    }

    /// Decodes a header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> StreamResult<Self> {
        if !Self::is_valid(bytes) {
            return Err(StreamError::InvalidHeader("missing VCS magic".into()));
        }
        let Some(bytes) = bytes.get(..HEADER_SIZE) else {
            return Err(StreamError::InvalidHeader(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        };

        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[3..7]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[7..15]);

        Ok(Self {
            compressor_id: CompressionTag::from_code(u32::from_be_bytes(id)),
            uncompressed_size: u64::from_be_bytes(size),
        })
    }

    /// Encodes the header.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..3].copy_from_slice(&COMPRESSION_MAGIC);
        bytes[3..7].copy_from_slice(&self.compressor_id.code().to_be_bytes());
        bytes[7..].copy_from_slice(&self.uncompressed_size.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let header = CompressionHeader {
            compressor_id: CompressionTag::from_code(0x0102_0304),
            uncompressed_size: 0x0A0B,
        };
        let bytes = header.encode();
        assert_eq!(
            bytes,
            [b'V', b'C', b'S', 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0x0A, 0x0B]
        );
        assert_eq!(CompressionHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_validity_is_the_magic_only() {
        assert!(CompressionHeader::is_valid(b"VCS"));
        assert!(!CompressionHeader::is_valid(b"VC"));
        assert!(!CompressionHeader::is_valid(b"PNG\0\0\0\0"));
        assert!(matches!(
            CompressionHeader::decode(b"VCS\0"),
            Err(StreamError::InvalidHeader(_))
        ));
    }
}
