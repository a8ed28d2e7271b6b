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

//! File requests and the handles callers keep to them.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ember_core::io::{
    AllocatedBuffer, CompressionInfo, RequestMemoryAllocator, RequestPath, RequestStatus,
};

use super::lock;

/// Request size meaning "everything from the offset to the end of the file".
pub const READ_TO_END: u64 = u64::MAX;

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// No stage in the stack knew how to execute the request.
    Unhandled,
    /// The file does not exist or could not be opened.
    FileNotFound,
    /// The requested range extends past the end of the file.
    ReadPastEnd,
    /// The operating system reported an error.
    Io(std::io::ErrorKind),
    /// The output buffer could not be allocated.
    OutOfMemory,
    /// Stored data could not be decoded.
    CorruptData,
    /// The request was cancelled before it finished.
    Canceled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Unhandled => write!(f, "no stage handled the request"),
            FailureReason::FileNotFound => write!(f, "file not found"),
            FailureReason::ReadPastEnd => write!(f, "read past the end of the file"),
            FailureReason::Io(kind) => write!(f, "I/O error: {kind}"),
            FailureReason::OutOfMemory => write!(f, "out of memory"),
            FailureReason::CorruptData => write!(f, "corrupt data"),
            FailureReason::Canceled => write!(f, "canceled"),
        }
    }
}

impl From<std::io::Error> for FailureReason {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => FailureReason::FileNotFound,
            std::io::ErrorKind::UnexpectedEof => FailureReason::ReadPastEnd,
            kind => FailureReason::Io(kind),
        }
    }
}

/// Keeps a [`RequestMemoryAllocator`] locked for as long as the lease lives.
pub struct AllocatorLease {
    allocator: Arc<dyn RequestMemoryAllocator>,
}

impl AllocatorLease {
    /// Locks `allocator` until the lease is dropped.
    pub fn new(allocator: Arc<dyn RequestMemoryAllocator>) -> Self {
        allocator.lock_allocator();
        Self { allocator }
    }

    /// The leased allocator.
    pub fn allocator(&self) -> &Arc<dyn RequestMemoryAllocator> {
        &self.allocator
    }
}

impl Clone for AllocatorLease {
    fn clone(&self) -> Self {
        Self::new(self.allocator.clone())
    }
}

impl Drop for AllocatorLease {
    fn drop(&mut self) {
        self.allocator.unlock_allocator();
    }
}

impl fmt::Debug for AllocatorLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AllocatorLease")
    }
}

/// Where the bytes of a read end up.
#[derive(Debug)]
pub enum ReadBuffer {
    /// A plain vector, resized to the exact request size.
    Vec(Vec<u8>),
    /// Not allocated yet; the executing stage allocates an aligned buffer from
    /// the leased allocator.
    Allocator(AllocatorLease),
    /// A buffer obtained from a request allocator.
    Allocated {
        /// The buffer itself. Dropped before the lease.
        buffer: AllocatedBuffer,
        /// The allocator the buffer came from.
        lease: AllocatorLease,
    },
}

impl Default for ReadBuffer {
    fn default() -> Self {
        ReadBuffer::Vec(Vec::new())
    }
}

impl ReadBuffer {
    /// A target that allocates from `allocator` once the read size is known.
    pub fn with_allocator(allocator: Arc<dyn RequestMemoryAllocator>) -> Self {
        ReadBuffer::Allocator(AllocatorLease::new(allocator))
    }

    /// Returns `true` for targets backed by a request allocator.
    ///
    /// Storage reads into these use aligned offsets and sizes.
    pub fn is_allocator_target(&self) -> bool {
        !matches!(self, ReadBuffer::Vec(_))
    }

    /// The buffer's bytes. Empty until a stage has filled it.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ReadBuffer::Vec(bytes) => bytes,
            ReadBuffer::Allocator(_) => &[],
            ReadBuffer::Allocated { buffer, .. } => buffer.as_slice(),
        }
    }

    /// The buffer's bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            ReadBuffer::Vec(bytes) => bytes,
            ReadBuffer::Allocator(_) => &mut [],
            ReadBuffer::Allocated { buffer, .. } => buffer.as_mut_slice(),
        }
    }

    /// Makes room for `padding + size` bytes.
    ///
    /// Vectors are resized to exactly that length. Allocator targets allocate
    /// `recommended` bytes (at least the minimum) aligned to `alignment`, and
    /// reuse their current buffer when it is already large enough.
    pub fn reserve(
        &mut self,
        padding: usize,
        size: usize,
        recommended: u64,
        alignment: usize,
    ) -> Result<(), FailureReason> {
        let minimal = padding
            .checked_add(size)
            .ok_or(FailureReason::OutOfMemory)?;
        let lease = match self {
            ReadBuffer::Vec(bytes) => {
                bytes.clear();
                bytes.resize(minimal, 0);
                return Ok(());
            }
            ReadBuffer::Allocated { buffer, .. } if buffer.len() >= minimal => return Ok(()),
            ReadBuffer::Allocated { lease, .. } => lease.clone(),
            ReadBuffer::Allocator(lease) => lease.clone(),
        };
        let recommended = recommended.max(minimal as u64);
        let buffer = AllocatedBuffer::allocate(
            lease.allocator().clone(),
            minimal as u64,
            recommended,
            alignment,
        )
        .ok_or(FailureReason::OutOfMemory)?;
        *self = ReadBuffer::Allocated { buffer, lease };
        Ok(())
    }

    /// Converts the buffer into an owned vector, copying if it is not one already.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            ReadBuffer::Vec(bytes) => bytes,
            other => other.as_slice().to_vec(),
        }
    }
}

/// A read of a plain file range.
#[derive(Debug)]
pub struct ReadRequestData {
    /// The file to read.
    pub path: RequestPath,
    /// First byte to read.
    pub offset: u64,
    /// Number of bytes to read, or [`READ_TO_END`].
    pub size: u64,
    /// Receives the data.
    pub output: ReadBuffer,
    /// Bytes in front of the requested data inside `output`.
    pub padding: usize,
    /// Length of the whole file, filled in by the stage that opened it.
    pub file_size: Option<u64>,
}

impl ReadRequestData {
    /// A read of `size` bytes at `offset` into `output`.
    pub fn new(path: RequestPath, offset: u64, size: u64, output: ReadBuffer) -> Self {
        Self {
            path,
            offset,
            size,
            output,
            padding: 0,
            file_size: None,
        }
    }

    /// The requested bytes, once the read has completed.
    pub fn data(&self) -> &[u8] {
        window(self.output.as_slice(), self.padding, self.size)
    }

    /// The file byte at which `output` starts.
    pub fn buffer_file_offset(&self) -> u64 {
        self.offset - self.padding as u64
    }
}

/// A read of an entry stored inside an archive.
#[derive(Debug)]
pub struct CompressedReadData {
    /// The path the caller asked for.
    pub path: RequestPath,
    /// Where and how the entry is stored.
    pub info: CompressionInfo,
    /// First byte to read, in uncompressed coordinates.
    pub offset: u64,
    /// Number of uncompressed bytes to read, or [`READ_TO_END`].
    pub size: u64,
    /// Receives the decompressed data.
    pub output: ReadBuffer,
}

impl CompressedReadData {
    /// The requested bytes, once the read has completed.
    pub fn data(&self) -> &[u8] {
        window(self.output.as_slice(), 0, self.size)
    }
}

fn window(bytes: &[u8], padding: usize, size: u64) -> &[u8] {
    let start = padding.min(bytes.len());
    let end = usize::try_from(size)
        .ok()
        .and_then(|size| start.checked_add(size))
        .map_or(bytes.len(), |end| end.min(bytes.len()));
    &bytes[start..end]
}

/// What a request asks the stack to do.
#[derive(Debug)]
pub enum RequestCommand {
    /// Read a range of a file.
    Read(ReadRequestData),
    /// Read a range of an archived entry.
    CompressedRead(CompressedReadData),
    /// Check whether a file exists.
    FileExistsCheck {
        /// The file to look for.
        path: RequestPath,
        /// The answer, once the request has completed.
        found: bool,
    },
    /// Look up the length of a file.
    FileMetaDataRetrieval {
        /// The file to inspect.
        path: RequestPath,
        /// The length, once the request has completed.
        file_size: Option<u64>,
    },
    /// Drop everything cached about one file.
    Flush {
        /// The file to forget.
        path: RequestPath,
    },
    /// Drop everything cached about every file.
    FlushAll,
}

impl RequestCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestCommand::Read(_) => "Read",
            RequestCommand::CompressedRead(_) => "CompressedRead",
            RequestCommand::FileExistsCheck { .. } => "FileExistsCheck",
            RequestCommand::FileMetaDataRetrieval { .. } => "FileMetaDataRetrieval",
            RequestCommand::Flush { .. } => "Flush",
            RequestCommand::FlushAll => "FlushAll",
        }
    }

    /// The file the command refers to, if any.
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            RequestCommand::Read(read) => Some(&read.path),
            RequestCommand::CompressedRead(read) => Some(&read.path),
            RequestCommand::FileExistsCheck { path, .. }
            | RequestCommand::FileMetaDataRetrieval { path, .. }
            | RequestCommand::Flush { path } => Some(path),
            RequestCommand::FlushAll => None,
        }
    }

    /// Whether reaching the end of the stack without being handled is a failure.
    ///
    /// Existence checks and flushes have nothing left to do when no stage
    /// claimed them, so they complete instead.
    pub fn fails_when_unhandled(&self) -> bool {
        matches!(
            self,
            RequestCommand::Read(_)
                | RequestCommand::CompressedRead(_)
                | RequestCommand::FileMetaDataRetrieval { .. }
        )
    }

    /// Turns a plain read into a read of the archived entry described by `info`.
    ///
    /// Other commands are left untouched.
    pub fn convert_to_compressed_read(&mut self, info: CompressionInfo) {
        if let RequestCommand::Read(read) = self {
            *self = RequestCommand::CompressedRead(CompressedReadData {
                path: mem::take(&mut read.path),
                info,
                offset: read.offset,
                size: read.size,
                output: mem::take(&mut read.output),
            });
        }
    }
}

/// Invoked on the streamer thread once a request has finished.
pub type CompletionCallback = Box<dyn FnOnce(&FileRequest) + Send>;

/// A request in flight.
///
/// Shared between the caller's [`RequestHandle`], the stages that hold it and
/// the streamer context. Status changes are atomic; the command is behind a
/// mutex so stages can fill in results.
pub struct FileRequest {
    id: u64,
    internal: bool,
    command: Mutex<RequestCommand>,
    status: AtomicU8,
    failure: Mutex<Option<FailureReason>>,
    cancelled: AtomicBool,
    estimated_completion: Mutex<Option<Instant>>,
    callback: Mutex<Option<CompletionCallback>>,
    notifier: Mutex<Option<flume::Sender<RequestStatus>>>,
    completion: flume::Receiver<RequestStatus>,
}

/// Shared pointer to a [`FileRequest`].
pub type FileRequestPtr = Arc<FileRequest>;

impl FileRequest {
    pub(crate) fn new(id: u64, command: RequestCommand, internal: bool) -> FileRequestPtr {
        let (notifier, completion) = flume::bounded(1);
        Arc::new(Self {
            id,
            internal,
            command: Mutex::new(command),
            status: AtomicU8::new(RequestStatus::Pending as u8),
            failure: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            estimated_completion: Mutex::new(None),
            callback: Mutex::new(None),
            notifier: Mutex::new(Some(notifier)),
            completion,
        })
    }

    /// Unique id within the owning streamer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` for requests a stage issued on behalf of another request.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Locks and returns the command.
    pub fn command(&self) -> MutexGuard<'_, RequestCommand> {
        lock(&self.command)
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Moves the request to `status`. Terminal statuses are final.
    pub fn set_status(&self, status: RequestStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!RequestStatus::from_u8(current).is_terminal()).then_some(status as u8)
            });
    }

    /// Marks the request as successfully executed.
    pub fn complete(&self) {
        self.set_status(RequestStatus::Completed);
    }

    /// Marks the request as failed. The first reason recorded wins.
    pub fn fail(&self, reason: FailureReason) {
        if self.status().is_terminal() {
            return;
        }
        lock(&self.failure).get_or_insert(reason);
        self.set_status(RequestStatus::Failed);
    }

    /// Why the request failed, if it did.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        *lock(&self.failure)
    }

    /// Asks the stack to drop the request.
    ///
    /// Cancellation is cooperative: stages check the flag before doing work,
    /// and a request that already reached the device may still complete.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// When the request is expected to finish, as last estimated by the stack.
    pub fn estimated_completion(&self) -> Option<Instant> {
        *lock(&self.estimated_completion)
    }

    pub fn set_estimated_completion(&self, at: Instant) {
        *lock(&self.estimated_completion) = Some(at);
    }

    pub(crate) fn set_callback(&self, callback: CompletionCallback) {
        *lock(&self.callback) = Some(callback);
    }

    /// Runs the completion callback and wakes the caller's handle.
    pub(crate) fn notify_completion(&self) {
        let callback = lock(&self.callback).take();
        if let Some(callback) = callback {
            callback(self);
        }
        if let Some(notifier) = lock(&self.notifier).take() {
            let _ = notifier.send(self.status());
        }
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("internal", &self.internal)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The result of a completed read, moved out of its request.
#[derive(Debug)]
pub struct ReadOutput {
    buffer: ReadBuffer,
    padding: usize,
    len: usize,
}

impl ReadOutput {
    /// The bytes that were asked for.
    pub fn data(&self) -> &[u8] {
        window(self.buffer.as_slice(), self.padding, self.len as u64)
    }

    /// The whole buffer, including padding and alignment slack.
    pub fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }

    /// Bytes in front of the data inside the buffer.
    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_buffer(self) -> ReadBuffer {
        self.buffer
    }
}

/// The caller's side of a submitted request.
pub struct RequestHandle {
    request: FileRequestPtr,
    completion: flume::Receiver<RequestStatus>,
}

impl RequestHandle {
    pub(crate) fn new(request: FileRequestPtr) -> Self {
        let completion = request.completion.clone();
        Self {
            request,
            completion,
        }
    }

    pub fn id(&self) -> u64 {
        self.request.id()
    }

    pub fn request(&self) -> &FileRequestPtr {
        &self.request
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.request.failure_reason()
    }

    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Blocks until the request has finished and its callback has run.
    pub fn wait(&self) -> RequestStatus {
        match self.completion.recv() {
            Ok(status) => status,
            Err(_) => self.request.status(),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestStatus> {
        match self.completion.recv_timeout(timeout) {
            Ok(status) => Some(status),
            Err(flume::RecvTimeoutError::Disconnected) => Some(self.request.status()),
            Err(flume::RecvTimeoutError::Timeout) => None,
        }
    }

    /// Moves the read result out of a completed read request.
    ///
    /// Returns `None` for other commands, unfinished or failed requests, and
    /// when the output was already taken.
    pub fn take_read_output(&self) -> Option<ReadOutput> {
        if self.request.status() != RequestStatus::Completed {
            return None;
        }
        let mut command = self.request.command();
        let (buffer, padding, len) = match &mut *command {
            RequestCommand::Read(read) => {
                let len = read.data().len();
                (mem::take(&mut read.output), read.padding, len)
            }
            RequestCommand::CompressedRead(read) => {
                let len = read.data().len();
                (mem::take(&mut read.output), 0, len)
            }
            _ => return None,
        };
        if matches!(&buffer, ReadBuffer::Vec(bytes) if bytes.is_empty()) && len == 0 {
            return None;
        }
        Some(ReadOutput {
            buffer,
            padding,
            len,
        })
    }

    /// The answer of a completed existence check.
    pub fn file_exists(&self) -> Option<bool> {
        if self.request.status() != RequestStatus::Completed {
            return None;
        }
        match &*self.request.command() {
            RequestCommand::FileExistsCheck { found, .. } => Some(*found),
            _ => None,
        }
    }

    /// The answer of a completed metadata request.
    pub fn file_size(&self) -> Option<u64> {
        match &*self.request.command() {
            RequestCommand::FileMetaDataRetrieval { file_size, .. } => *file_size,
            RequestCommand::Read(read) => read.file_size,
            _ => None,
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("request", &self.request)
            .finish()
    }
}
