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

//! Byte streams the compressors and archives read from and write to.

mod compressor_stream;

pub use compressor_stream::{CompressorStream, MAX_HEADER_SIZE};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{StreamError, StreamResult};

/// How a [`FileStream`] opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read an existing file.
    Read,
    /// Create the file, truncating it if it exists.
    Write,
    /// Read and write, creating the file if it is missing.
    ReadWrite,
}

/// A random-access byte stream.
pub trait ByteStream: Send {
    /// Returns `true` while the stream can be read or written.
    fn is_open(&self) -> bool;

    /// Opens the stream again after it was closed or failed to open.
    fn reopen(&mut self) -> StreamResult<()>;

    /// Closes the stream. Closing twice is a no-op.
    fn close(&mut self);

    /// Current length of the stream in bytes.
    fn size(&mut self) -> StreamResult<u64>;

    /// Reads up to `buf.len()` bytes at `offset`. Returns fewer bytes only at
    /// the end of the stream.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StreamResult<usize>;

    /// Writes all of `data` at `offset`, growing the stream if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StreamResult<()>;

    /// Flushes buffered writes to the backing storage.
    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }
}

/// Reads until `buf` is full or the reader is exhausted.
pub(crate) fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A [`ByteStream`] over a file on disk.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    mode: OpenMode,
    file: Option<File>,
}

impl FileStream {
    /// Opens `path` with `mode`.
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> StreamResult<Self> {
        let mut stream = Self::closed(path, mode);
        stream.reopen()?;
        Ok(stream)
    }

    /// Creates a stream for `path` without opening it yet.
    pub fn closed(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            mode,
            file: None,
        }
    }

    /// The path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mode the file is opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn file(&mut self) -> StreamResult<&mut File> {
        self.file.as_mut().ok_or(StreamError::StreamClosed)
    }
}

impl ByteStream for FileStream {
    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn reopen(&mut self) -> StreamResult<()> {
        let mut options = OpenOptions::new();
        match self.mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
        };
        self.file = Some(options.open(&self.path)?);
        // Later reopens keep what was written.
        if self.mode == OpenMode::Write {
            self.mode = OpenMode::ReadWrite;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn size(&mut self) -> StreamResult<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StreamResult<usize> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(read_fully(file, buf)?)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StreamResult<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(self.file()?.flush()?)
    }
}

/// A [`ByteStream`] over a growable in-memory buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    closed: bool,
}

impl MemoryStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            closed: false,
        }
    }

    /// The stream contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the stream and returns its contents.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ByteStream for MemoryStream {
    fn is_open(&self) -> bool {
        !self.closed
    }

    fn reopen(&mut self) -> StreamResult<()> {
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn size(&mut self) -> StreamResult<u64> {
        if self.closed {
            return Err(StreamError::StreamClosed);
        }
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> StreamResult<usize> {
        if self.closed {
            return Err(StreamError::StreamClosed);
        }
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StreamResult<()> {
        if self.closed {
            return Err(StreamError::StreamClosed);
        }
        let start = usize::try_from(offset).map_err(|_| {
            StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "offset exceeds the address space",
            ))
        })?;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Tries to get `stream` open, reopening it up to `attempts` times with
/// `delay` between attempts. Returns whether the stream ended up open.
pub fn retry_open_stream(stream: &mut dyn ByteStream, attempts: u32, delay: Duration) -> bool {
    for attempt in 1..=attempts {
        if stream.is_open() {
            return true;
        }
        match stream.reopen() {
            Ok(()) => return true,
            Err(error) => {
                log::warn!("Opening stream failed (attempt {attempt}/{attempts}): {error}");
                if attempt < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }
    stream.is_open()
}
