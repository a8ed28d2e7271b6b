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

//! Compression codecs, stream headers, and archive discovery.

mod bus;
mod compressor;
mod header;
mod lz4;
mod pack;

pub use bus::{CompressionBus, CompressionProvider, ProviderId};
pub use compressor::{Compressor, CompressorData, CompressorRegistry};
pub use header::{CompressionHeader, COMPRESSION_MAGIC, HEADER_SIZE, MAX_EXPANSION_RATIO};
pub use lz4::{lz4_decompression_func, Lz4Compressor, DEFAULT_BLOCK_SIZE, LZ4_COMPRESSOR_ID};
pub use pack::{PackArchive, PackEntry, PackManifest, PackWriter};
