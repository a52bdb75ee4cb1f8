//! Record content sources and replayable recordings of fetched bytes.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;

/// Byte stream feeding one record body.
pub trait ContentSource: Read + Send {
    /// Bytes still unread in the underlying recording.
    ///
    /// `None` when the source cannot tell. After the declared body has been
    /// consumed, anything other than `Some(0)` means the declared length does
    /// not describe the stream.
    fn remaining(&self) -> Option<i64> {
        None
    }
}

/// Content held in memory.
#[derive(Debug, Clone)]
pub struct SliceSource {
    data: Bytes,
    pos: usize,
}

impl SliceSource {
    /// Wrap a buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl Read for SliceSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl ContentSource for SliceSource {
    fn remaining(&self) -> Option<i64> {
        Some((self.data.len() - self.pos) as i64)
    }
}

/// Adapter for any reader that cannot report what is left.
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read + Send> ReaderSource<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Send> Read for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Read + Send> ContentSource for ReaderSource<R> {}

/// A recorded stream that can be replayed from the start any number of times.
pub trait ReplaySource: Send + Sync {
    /// Total recorded size in bytes.
    fn size(&self) -> u64;

    /// Offset where the payload begins after protocol headers; 0 if unknown.
    fn content_begin(&self) -> u64;

    /// Fresh source over the whole recording.
    fn replay(&self) -> Box<dyn ContentSource>;

    /// Fresh source over the first `len` bytes.
    fn replay_prefix(&self, len: u64) -> Box<dyn ContentSource>;
}

/// In-memory recording.
#[derive(Debug, Clone, Default)]
pub struct RecordedBytes {
    data: Bytes,
    content_begin: u64,
}

impl RecordedBytes {
    /// Recording with no known header/payload split.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_begin: 0,
        }
    }

    /// Recording whose payload starts at `content_begin`.
    pub fn with_content_begin(data: impl Into<Bytes>, content_begin: u64) -> Self {
        let data = data.into();
        let content_begin = content_begin.min(data.len() as u64);
        Self {
            data,
            content_begin,
        }
    }

    /// Recording of an HTTP message; the payload starts after the first blank line.
    pub fn http(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let content_begin = data
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p as u64 + 4)
            .unwrap_or(0);
        Self {
            data,
            content_begin,
        }
    }

    /// Recorded bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Bytes after `content_begin`.
    pub fn payload(&self) -> Bytes {
        self.data.slice(self.content_begin as usize..)
    }
}

impl ReplaySource for RecordedBytes {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn content_begin(&self) -> u64 {
        self.content_begin
    }

    fn replay(&self) -> Box<dyn ContentSource> {
        Box::new(SliceSource::new(self.data.clone()))
    }

    fn replay_prefix(&self, len: u64) -> Box<dyn ContentSource> {
        let end = (len as usize).min(self.data.len());
        Box::new(SliceSource::new(self.data.slice(..end)))
    }
}

/// Request and response bytes captured for one fetch.
#[derive(Clone, Default)]
pub struct Recorder {
    /// Bytes received from the server.
    pub response: Option<Arc<dyn ReplaySource>>,
    /// Bytes sent to the server.
    pub request: Option<Arc<dyn ReplaySource>>,
}

impl Recorder {
    /// Recorder holding only a response.
    pub fn response_only(response: impl ReplaySource + 'static) -> Self {
        Self {
            response: Some(Arc::new(response)),
            request: None,
        }
    }

    /// Recorder holding both directions.
    pub fn exchange(request: impl ReplaySource + 'static, response: impl ReplaySource + 'static) -> Self {
        Self {
            response: Some(Arc::new(response)),
            request: Some(Arc::new(request)),
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("response_size", &self.response.as_ref().map(|r| r.size()))
            .field("request_size", &self.request.as_ref().map(|r| r.size()))
            .finish()
    }
}
