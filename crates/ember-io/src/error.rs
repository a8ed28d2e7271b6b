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

//! Error type shared by the streams, compressors, and archives.

use ember_core::io::{CompressionTag, PathError};
use thiserror::Error;

/// Errors raised by the stream and archive layers.
///
/// Request-level failures of the streamer are not errors of this type: they
/// end the request in the `Failed` status with a
/// [`FailureReason`](crate::streaming::FailureReason).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid compression header: {0}")]
    InvalidHeader(String),

    #[error("No compressor registered for id {0}")]
    UnknownCompressor(CompressionTag),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Compressed streams only support sequential writes (expected offset {expected}, got {requested})")]
    NonSequentialWrite { expected: u64, requested: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Path error: {0}")]
    Path(#[from] PathError),
}

/// A `Result` alias for [`StreamError`].
pub type StreamResult<T> = Result<T, StreamError>;

impl From<bincode::error::DecodeError> for StreamError {
    fn from(error: bincode::error::DecodeError) -> Self {
        StreamError::Archive(error.to_string())
    }
}

impl From<bincode::error::EncodeError> for StreamError {
    fn from(error: bincode::error::EncodeError) -> Self {
        StreamError::Archive(error.to_string())
    }
}

impl From<ron::error::SpannedError> for StreamError {
    fn from(error: ron::error::SpannedError) -> Self {
        StreamError::Config(error.to_string())
    }
}

impl From<ron::Error> for StreamError {
    fn from(error: ron::Error) -> Self {
        StreamError::Config(error.to_string())
    }
}
