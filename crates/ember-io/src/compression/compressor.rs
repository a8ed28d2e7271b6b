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

//! The codec contract used by [`CompressorStream`](crate::stream::CompressorStream).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ember_core::io::CompressionTag;

use super::header::CompressionHeader;
use super::lz4::Lz4Compressor;
use crate::error::{StreamError, StreamResult};
use crate::stream::ByteStream;

/// Per-stream state of a compressor.
///
/// The stream owns this object; the compressor keeps whatever it needs
/// between calls in [`state`](Self::state_mut).
pub struct CompressorData {
    /// The codec the stream is compressed with.
    pub compressor_id: CompressionTag,
    /// Size of the data once decompressed. Grows while writing.
    pub uncompressed_size: u64,
    state: Option<Box<dyn Any + Send>>,
}

impl CompressorData {
    /// Creates the state for a stream described by `header`.
    pub fn new(header: CompressionHeader) -> Self {
        Self {
            compressor_id: header.compressor_id,
            uncompressed_size: header.uncompressed_size,
            state: None,
        }
    }

    /// The header describing the stream in its current state.
    pub fn header(&self) -> CompressionHeader {
        CompressionHeader {
            compressor_id: self.compressor_id,
            uncompressed_size: self.uncompressed_size,
        }
    }

    /// Attaches codec specific state, replacing any previous state.
    pub fn set_state<T: Any + Send>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }

    /// Drops the codec specific state.
    pub fn clear_state(&mut self) {
        self.state = None;
    }

    /// The codec specific state, if it has type `T`.
    pub fn state_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut::<T>()
    }
}

impl fmt::Debug for CompressorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressorData")
            .field("compressor_id", &self.compressor_id)
            .field("uncompressed_size", &self.uncompressed_size)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// A streaming codec.
///
/// Offsets passed to [`read`](Self::read) and [`write`](Self::write) are
/// positions in the *uncompressed* data; the compressor maps them onto the
/// compressed bytes of the stream.
pub trait Compressor: Send + Sync {
    /// Uniquely identifies the codec. Written into every stream header.
    fn compressor_id(&self) -> CompressionTag;

    /// Called once when a stream is opened for reading.
    ///
    /// `read_ahead` holds the first bytes of the stream (up to
    /// [`MAX_HEADER_SIZE`](crate::stream::MAX_HEADER_SIZE)), header included.
    fn read_header_and_data(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        read_ahead: &[u8],
    ) -> StreamResult<()>;

    /// Called once, before any payload, when a stream is created for writing.
    /// Must write the stream header.
    fn write_header_and_data(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
    ) -> StreamResult<()>;

    /// Reads decompressed bytes starting at `offset`. Returns fewer bytes than
    /// `output.len()` only at the end of the data.
    fn read(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        offset: u64,
        output: &mut [u8],
    ) -> StreamResult<usize>;

    /// Compresses `input`, which belongs at `offset` in the uncompressed data.
    fn write(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
        offset: u64,
        input: &[u8],
    ) -> StreamResult<usize>;

    /// Ends the current unit of compression so a reader can start decoding at
    /// the current position without touching earlier data.
    fn write_seek_point(
        &self,
        stream: &mut dyn ByteStream,
        data: &mut CompressorData,
    ) -> StreamResult<()>;

    /// Flushes pending data and finalizes the stream.
    fn close(&self, stream: &mut dyn ByteStream, data: &mut CompressorData) -> StreamResult<()>;

    /// Decompresses a complete stream (header included) held in memory into
    /// `output`, returning the number of bytes produced.
    fn decompress_buffer(&self, compressed: &[u8], output: &mut [u8]) -> StreamResult<usize>;
}

/// The compressors available to streams, by id.
#[derive(Clone, Default)]
pub struct CompressorRegistry {
    compressors: HashMap<CompressionTag, Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Lz4Compressor::default()));
        registry
    }

    /// Registers a compressor, replacing one with the same id.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        let id = compressor.compressor_id();
        if self.compressors.insert(id, compressor).is_some() {
            log::warn!("Compressor {id} registered twice; the last registration wins.");
        }
    }

    /// Looks a compressor up by id.
    pub fn get(&self, id: CompressionTag) -> StreamResult<Arc<dyn Compressor>> {
        self.compressors
            .get(&id)
            .cloned()
            .ok_or(StreamError::UnknownCompressor(id))
    }

    /// Decompresses an in-memory stream with the codec named in its header.
    pub fn decompress_buffer(&self, compressed: &[u8], output: &mut [u8]) -> StreamResult<usize> {
        let header = CompressionHeader::decode(compressed)?;
        self.get(header.compressor_id)?
            .decompress_buffer(compressed, output)
    }
}

impl fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.compressors.keys()).finish()
    }
}
