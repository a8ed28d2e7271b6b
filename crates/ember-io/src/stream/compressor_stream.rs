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

//! A stream that transparently decompresses (or compresses) its contents.

use std::sync::Arc;

use ember_core::io::CompressionTag;

use super::ByteStream;
use crate::compression::{CompressionHeader, Compressor, CompressorData, CompressorRegistry};
use crate::error::{StreamError, StreamResult};

/// Number of bytes read ahead when a stream is opened, so the compressor can
/// parse its header before the first real read.
pub const MAX_HEADER_SIZE: usize = 4096;

struct Codec {
    compressor: Arc<dyn Compressor>,
    data: CompressorData,
}

/// Wraps a [`ByteStream`] whose contents may be compressed.
///
/// Opening sniffs the first bytes: a stream starting with the `VCS` magic is
/// decoded by the compressor named in its header, anything else is read as-is.
/// Positions and lengths are always in uncompressed bytes.
pub struct CompressorStream<S: ByteStream> {
    inner: S,
    codec: Option<Codec>,
    writable: bool,
    closed: bool,
    position: u64,
}

impl<S: ByteStream> CompressorStream<S> {
    /// Opens `inner` for reading, detecting compression from its header.
    pub fn open(mut inner: S, registry: &CompressorRegistry) -> StreamResult<Self> {
        if !inner.is_open() {
            return Err(StreamError::StreamClosed);
        }

        let len = inner.size()?;
        let mut read_ahead = vec![0u8; len.min(MAX_HEADER_SIZE as u64) as usize];
        let read = inner.read_at(0, &mut read_ahead)?;
        read_ahead.truncate(read);

        let codec = if CompressionHeader::is_valid(&read_ahead) {
            let header = CompressionHeader::decode(&read_ahead)?;
            let compressor = registry.get(header.compressor_id)?;
            let mut data = CompressorData::new(header);
            compressor.read_header_and_data(&mut inner, &mut data, &read_ahead)?;
            log::trace!(
                "Opened {} compressed stream ({} bytes uncompressed)",
                header.compressor_id,
                header.uncompressed_size
            );
            Some(Codec { compressor, data })
        } else {
            None
        };

        Ok(Self {
            inner,
            codec,
            writable: false,
            closed: false,
            position: 0,
        })
    }

    /// Starts a new compressed stream in `inner`, writing its header.
    pub fn create(mut inner: S, compressor: Arc<dyn Compressor>) -> StreamResult<Self> {
        if !inner.is_open() {
            return Err(StreamError::StreamClosed);
        }
        let mut data = CompressorData::new(CompressionHeader {
            compressor_id: compressor.compressor_id(),
            uncompressed_size: 0,
        });
        compressor.write_header_and_data(&mut inner, &mut data)?;

        Ok(Self {
            inner,
            codec: Some(Codec { compressor, data }),
            writable: true,
            closed: false,
            position: 0,
        })
    }

    /// Returns `true` if the contents are compressed.
    pub fn is_compressed(&self) -> bool {
        self.codec.is_some()
    }

    /// The codec of a compressed stream.
    pub fn compressor_id(&self) -> Option<CompressionTag> {
        self.codec.as_ref().map(|codec| codec.data.compressor_id)
    }

    /// Length of the uncompressed contents.
    pub fn uncompressed_len(&mut self) -> StreamResult<u64> {
        match &self.codec {
            Some(codec) => Ok(codec.data.uncompressed_size),
            None => self.inner.size(),
        }
    }

    /// The current position in uncompressed bytes.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read position.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Reads at the current position and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        let read = self.read_at(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }

    /// Reads uncompressed bytes at `offset` without moving the position.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StreamResult<usize> {
        if self.closed {
            return Err(StreamError::StreamClosed);
        }
        match &mut self.codec {
            Some(codec) => codec
                .compressor
                .read(&mut self.inner, &mut codec.data, offset, buf),
            None => self.inner.read_at(offset, buf),
        }
    }

    /// Reads everything from the current position to the end.
    pub fn read_to_end(&mut self) -> StreamResult<Vec<u8>> {
        let remaining = self.uncompressed_len()?.saturating_sub(self.position);
        let too_large =
            || StreamError::Decompression(format!("cannot buffer {remaining} uncompressed bytes"));
        let len = usize::try_from(remaining).map_err(|_| too_large())?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| too_large())?;
        buf.resize(len, 0);
        let read = self.read(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Appends `input` to a stream created with [`create`](Self::create).
    pub fn write(&mut self, input: &[u8]) -> StreamResult<usize> {
        if self.closed {
            return Err(StreamError::StreamClosed);
        }
        let codec = match &mut self.codec {
            Some(codec) if self.writable => codec,
            _ => return Err(StreamError::StreamClosed),
        };
        let written = codec
            .compressor
            .write(&mut self.inner, &mut codec.data, self.position, input)?;
        self.position += written as u64;
        Ok(written)
    }

    /// Ends the current compression unit at the current position.
    pub fn write_seek_point(&mut self) -> StreamResult<()> {
        match &mut self.codec {
            Some(codec) if self.writable && !self.closed => codec
                .compressor
                .write_seek_point(&mut self.inner, &mut codec.data),
            _ => Err(StreamError::StreamClosed),
        }
    }

    /// Finalizes the stream and closes the inner stream. No writes are
    /// accepted afterwards.
    pub fn close(&mut self) -> StreamResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(codec) = &mut self.codec {
            codec.compressor.close(&mut self.inner, &mut codec.data)?;
        }
        self.inner.close();
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Consumes the wrapper and returns the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Lz4Compressor;
    use crate::stream::{FileStream, MemoryStream, OpenMode};
    use tempfile::tempdir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 199) as u8 ^ 0x5A).collect()
    }

    #[test]
    fn test_plain_streams_pass_through() {
        let registry = CompressorRegistry::with_defaults();
        let mut stream =
            CompressorStream::open(MemoryStream::from_vec(b"plain bytes".to_vec()), &registry)
                .unwrap();
        assert!(!stream.is_compressed());
        assert_eq!(stream.uncompressed_len().unwrap(), 11);
        stream.seek(6);
        assert_eq!(stream.read_to_end().unwrap(), b"bytes");
        assert!(matches!(stream.write(b"x"), Err(StreamError::StreamClosed)));
    }

    #[test]
    fn test_seek_points_split_blocks_and_reads_cross_them() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.vcs");
        let input = sample(10_000);

        let file = FileStream::open(&path, OpenMode::Write).unwrap();
        let mut writer =
            CompressorStream::create(file, Arc::new(Lz4Compressor::new(4096))).unwrap();
        writer.write(&input[..3000]).unwrap();
        writer.write_seek_point().unwrap();
        writer.write(&input[3000..]).unwrap();
        writer.close().unwrap();
        assert!(writer.write(b"late").is_err());

        let registry = CompressorRegistry::with_defaults();
        let file = FileStream::open(&path, OpenMode::Read).unwrap();
        let mut reader = CompressorStream::open(file, &registry).unwrap();
        assert!(reader.is_compressed());
        assert_eq!(reader.uncompressed_len().unwrap(), 10_000);

        let mut window = vec![0u8; 500];
        assert_eq!(reader.read_at(2800, &mut window).unwrap(), 500);
        assert_eq!(window, &input[2800..3300]);

        assert_eq!(reader.read_to_end().unwrap(), input);
        let mut tail = [0u8; 8];
        assert_eq!(reader.read_at(9_996, &mut tail).unwrap(), 4);
    }

    #[test]
    fn test_writes_must_be_sequential() {
        let mut writer =
            CompressorStream::create(MemoryStream::new(), Arc::new(Lz4Compressor::default()))
                .unwrap();
        writer.write(b"abc").unwrap();
        writer.seek(10);
        assert!(matches!(
            writer.write(b"def"),
            Err(StreamError::NonSequentialWrite {
                expected: 3,
                requested: 10
            })
        ));
    }

    #[test]
    fn test_unknown_compressor_is_reported() {
        let bytes = CompressionHeader {
            compressor_id: CompressionTag::from_chars(*b"ZSTD"),
            uncompressed_size: 0,
        }
        .encode();
        let registry = CompressorRegistry::with_defaults();
        let result = CompressorStream::open(MemoryStream::from_vec(bytes.to_vec()), &registry);
        assert!(matches!(result, Err(StreamError::UnknownCompressor(_))));
    }
}
