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

//! LZ4 block compression for streams and archive entries.
//!
//! After the stream header the payload is a sequence of blocks, each written
//! as `[u32 BE compressed length][u32 BE uncompressed length][bytes]`. Every
//! block is decompressed on its own, so block boundaries double as seek
//! points. The header's uncompressed size is patched when the stream closes.

use std::sync::Arc;

use ember_core::io::{CompressionInfo, CompressionTag, DecompressionFunc};

use super::compressor::{Compressor, CompressorData};
use super::header::{CompressionHeader, HEADER_SIZE};
use crate::error::{StreamError, StreamResult};
use crate::stream::{ByteStream, CompressorStream, MemoryStream};

/// The id LZ4 streams carry in their header.
pub const LZ4_COMPRESSOR_ID: CompressionTag = CompressionTag::from_chars(*b"LZ4B");

/// Default amount of uncompressed data per block.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const BLOCK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    payload_offset: u64,
    compressed_len: usize,
    uncompressed_start: u64,
    uncompressed_len: usize,
}

impl BlockEntry {
    fn uncompressed_end(&self) -> u64 {
        self.uncompressed_start + self.uncompressed_len as u64
    }
}

#[derive(Debug, Default)]
struct ReadState {
    blocks: Vec<BlockEntry>,
    cached: Option<(usize, Vec<u8>)>,
}

#[derive(Debug)]
struct WriteState {
    pending: Vec<u8>,
    next_block_offset: u64,
}

fn parse_block_header(bytes: &[u8]) -> (usize, usize) {
    let mut compressed = [0u8; 4];
    let mut uncompressed = [0u8; 4];
    compressed.copy_from_slice(&bytes[..4]);
    uncompressed.copy_from_slice(&bytes[4..8]);
    (
        u32::from_be_bytes(compressed) as usize,
        u32::from_be_bytes(uncompressed) as usize,
    )
}

fn flush_block(
    stream: &mut dyn ByteStream,
    state: &mut WriteState,
    len: usize,
) -> StreamResult<()> {
    if len == 0 {
        return Ok(());
    }
    let compressed = lz4_flex::block::compress(&state.pending[..len]);
    let (Ok(compressed_len), Ok(uncompressed_len)) =
        (u32::try_from(compressed.len()), u32::try_from(len))
    else {
        return Err(StreamError::Decompression("block too large".into()));
    };

    let mut block_header = [0u8; BLOCK_HEADER_SIZE];
    block_header[..4].copy_from_slice(&compressed_len.to_be_bytes());
    block_header[4..].copy_from_slice(&uncompressed_len.to_be_bytes());
    stream.write_at(state.next_block_offset, &block_header)?;
    stream.write_at(state.next_block_offset + BLOCK_HEADER_SIZE as u64, &compressed)?;

    state.next_block_offset += (BLOCK_HEADER_SIZE + compressed.len()) as u64;
    state.pending.drain(..len);
    Ok(())
}

/// LZ4 block compressor.
#[derive(Debug, Clone)]
pub struct Lz4Compressor {
    block_size: usize,
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl Lz4Compressor {
    /// Creates a compressor that cuts blocks of `block_size` uncompressed bytes.
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "LZ4 block size must be non-zero");
        Self { block_size }
    }

    /// Compresses `input` into a complete in-memory stream, header included.
    pub fn compress_to_vec(&self, input: &[u8]) -> StreamResult<Vec<u8>> {
        let mut stream = CompressorStream::create(MemoryStream::new(), Arc::new(self.clone()))?;
        stream.write(input)?;
        stream.close()?;
        Ok(stream.into_inner().into_inner())
    }
}

/// A [`DecompressionFunc`] for archive entries stored as LZ4 streams.
pub fn lz4_decompression_func() -> DecompressionFunc {
    Arc::new(|info: &CompressionInfo, compressed: &[u8], output: &mut [u8]| {
        match Lz4Compressor::default().decompress_buffer(compressed, output) {
            Ok(produced) => produced as u64 == info.uncompressed_size,
            Err(error) => {
                log::debug!(
                    "LZ4 entry in '{}' failed to decompress: {error}",
                    info.archive_filename.absolute_path()
                );
                false
            }
        }
    })
}

impl Compressor for Lz4Compressor {
    fn compressor_id(&self) -> CompressionTag {
        LZ4_COMPRESSOR_ID
    }

    fn read_header_and_data(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        read_ahead: &[u8],
    ) -> StreamResult<()> {
        let header = CompressionHeader::decode(read_ahead)?;
        let stream_len = stream.size()?;
        let mut blocks = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        let mut uncompressed_start = 0u64;

        while offset + BLOCK_HEADER_SIZE as u64 <= stream_len {
            let mut block_header = [0u8; BLOCK_HEADER_SIZE];
            let start = offset as usize;
            match read_ahead.get(start..start + BLOCK_HEADER_SIZE) {
                Some(bytes) => block_header.copy_from_slice(bytes),
                None => {
                    stream.read_at(offset, &mut block_header)?;
                }
            }
            let (compressed_len, uncompressed_len) = parse_block_header(&block_header);
            let payload_offset = offset + BLOCK_HEADER_SIZE as u64;
            if payload_offset + compressed_len as u64 > stream_len {
                return Err(StreamError::InvalidHeader(format!(
                    "block at offset {offset} is truncated"
                )));
            }

            blocks.push(BlockEntry {
                payload_offset,
                compressed_len,
                uncompressed_start,
                uncompressed_len,
            });
            uncompressed_start += uncompressed_len as u64;
            offset = payload_offset + compressed_len as u64;
        }

        if uncompressed_start != header.uncompressed_size {
            return Err(StreamError::InvalidHeader(format!(
                "blocks hold {uncompressed_start} bytes but the header announces {}",
                header.uncompressed_size
            )));
        }

        log::trace!("Opened LZ4 stream with {} blocks", blocks.len());
        data.set_state(ReadState {
            blocks,
            cached: None,
        });
        Ok(())
    }

    fn write_header_and_data(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
    ) -> StreamResult<()> {
        data.compressor_id = LZ4_COMPRESSOR_ID;
        data.uncompressed_size = 0;
        stream.write_at(0, &data.header().encode())?;
        data.set_state(WriteState {
            pending: Vec::with_capacity(self.block_size),
            next_block_offset: HEADER_SIZE as u64,
        });
        Ok(())
    }

    fn read(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        offset: u64,
        output: &mut [u8],
    ) -> StreamResult<usize> {
        let total = data.uncompressed_size;
        let state = data
            .state_mut::<ReadState>()
            .ok_or_else(|| StreamError::Decompression("stream is not open for reading".into()))?;

        let mut position = offset;
        let mut written = 0;
        while written < output.len() && position < total {
            let index = state
                .blocks
                .partition_point(|block| block.uncompressed_end() <= position);
            let Some(block) = state.blocks.get(index).copied() else {
                break;
            };

            if state.cached.as_ref().map(|(cached, _)| *cached) != Some(index) {
                let mut payload = vec![0u8; block.compressed_len];
                let read = stream.read_at(block.payload_offset, &mut payload)?;
                if read != payload.len() {
                    return Err(StreamError::Decompression(format!(
                        "block {index} ends early"
                    )));
                }
                let decoded = lz4_flex::block::decompress(&payload, block.uncompressed_len)
                    .map_err(|e| StreamError::Decompression(e.to_string()))?;
                if decoded.len() != block.uncompressed_len {
                    return Err(StreamError::Decompression(format!(
                        "block {index} decoded to {} bytes instead of {}",
                        decoded.len(),
                        block.uncompressed_len
                    )));
                }
                state.cached = Some((index, decoded));
            }

            let Some((_, decoded)) = state.cached.as_ref() else {
                break;
            };
            let within = (position - block.uncompressed_start) as usize;
            let count = (block.uncompressed_len - within).min(output.len() - written);
            output[written..written + count].copy_from_slice(&decoded[within..within + count]);
            written += count;
            position += count as u64;
        }
        Ok(written)
    }

    fn write(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        offset: u64,
        input: &[u8],
    ) -> StreamResult<usize> {
        if offset != data.uncompressed_size {
            return Err(StreamError::NonSequentialWrite {
                expected: data.uncompressed_size,
                requested: offset,
            });
        }
        data.uncompressed_size += input.len() as u64;
        let state = data
            .state_mut::<WriteState>()
            .ok_or(StreamError::StreamClosed)?;

        state.pending.extend_from_slice(input);
        while state.pending.len() >= self.block_size {
            flush_block(stream, state, self.block_size)?;
        }
        Ok(input.len())
    }

    fn write_seek_point(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
    ) -> StreamResult<()> {
        let state = data
            .state_mut::<WriteState>()
            .ok_or(StreamError::StreamClosed)?;
        let pending = state.pending.len();
        flush_block(stream, state, pending)
    }

    fn close(&self, stream: &mut dyn ByteStream, data: &mut CompressorData) -> StreamResult<()> {
        if let Some(state) = data.state_mut::<WriteState>() {
            let pending = state.pending.len();
            flush_block(stream, state, pending)?;
            stream.write_at(0, &data.header().encode())?;
            stream.flush()?;
        }
        data.clear_state();
        Ok(())
    }

    fn decompress_buffer(&self, compressed: &[u8], output: &mut [u8]) -> StreamResult<usize> {
        let header = CompressionHeader::decode(compressed)?;
        let mut offset = HEADER_SIZE;
        let mut produced = 0usize;

        while offset + BLOCK_HEADER_SIZE <= compressed.len() {
            let (compressed_len, uncompressed_len) =
                parse_block_header(&compressed[offset..offset + BLOCK_HEADER_SIZE]);
            let payload_start = offset + BLOCK_HEADER_SIZE;
            let payload = compressed
                .get(payload_start..payload_start + compressed_len)
                .ok_or_else(|| StreamError::Decompression("truncated block".into()))?;
            let target = output
                .get_mut(produced..produced + uncompressed_len)
                .ok_or_else(|| StreamError::Decompression("output buffer too small".into()))?;

            let decoded = lz4_flex::block::decompress_into(payload, target)
                .map_err(|e| StreamError::Decompression(e.to_string()))?;
            if decoded != uncompressed_len {
                return Err(StreamError::Decompression(format!(
                    "block decoded to {decoded} bytes instead of {uncompressed_len}"
                )));
            }
            produced += decoded;
            offset = payload_start + compressed_len;
        }

        if produced as u64 != header.uncompressed_size {
            return Err(StreamError::Decompression(format!(
                "stream decoded to {produced} bytes but the header announces {}",
                header.uncompressed_size
            )));
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 7) % 251) as u8).collect()
    }

    #[test]
    fn test_compress_to_vec_then_decompress_buffer() {
        let input = sample(200_000);
        let compressor = Lz4Compressor::new(16 * 1024);
        let compressed = compressor.compress_to_vec(&input).unwrap();

        let header = CompressionHeader::decode(&compressed).unwrap();
        assert_eq!(header.compressor_id, LZ4_COMPRESSOR_ID);
        assert_eq!(header.uncompressed_size, input.len() as u64);
        assert!(compressed.len() < input.len());

        let mut output = vec![0u8; input.len()];
        assert_eq!(
            compressor.decompress_buffer(&compressed, &mut output).unwrap(),
            input.len()
        );
        assert_eq!(output, input);
    }

    #[test]
    fn test_decompress_buffer_rejects_truncated_data() {
        let compressed = Lz4Compressor::default()
            .compress_to_vec(&sample(1000))
            .unwrap();
        let mut output = vec![0u8; 1000];
        let truncated = &compressed[..compressed.len() - 3];
        assert!(Lz4Compressor::default()
            .decompress_buffer(truncated, &mut output)
            .is_err());
    }

    #[test]
    fn test_decompression_func_checks_size() {
        let input = sample(4096);
        let compressed = Lz4Compressor::default().compress_to_vec(&input).unwrap();
        let func = lz4_decompression_func();

        let mut info = CompressionInfo {
            uncompressed_size: input.len() as u64,
            compressed_size: compressed.len() as u64,
            is_compressed: true,
            ..Default::default()
        };
        let mut output = vec![0u8; input.len()];
        assert!(func(&info, &compressed, &mut output));
        assert_eq!(output, input);

        info.uncompressed_size += 1;
        assert!(!func(&info, &compressed, &mut output));
    }
}
