//! Stream adapters shared by the relays

use crate::mitm::resource_state::now_millis;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Upper bound on header lines parsed out of a recorded head
const MAX_HEAD_HEADERS: usize = 128;

/// Bytes a `HeadLog` keeps per connection
pub const HEAD_LOG_LIMIT: usize = 64 * 1024;

/// Any duplex byte stream the relays can own
pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased duplex stream (plain TCP, upstream proxy tunnel, TLS, ...)
pub type BoxedIo = Box<dyn ProxyIo>;

/// Replays bytes already read off a stream before reading from it again.
///
/// Used after peeking at the first bytes of a tunnel to classify it.
pub struct PrefixedStream<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> PrefixedStream<T> {
    pub fn new(prefix: impl Into<Bytes>, inner: T) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn into_inner(self) -> (Bytes, T) {
        (self.prefix, self.inner)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Copies relayed body chunks up to a limit. Past the limit nothing is
/// kept and `finish` returns `None`.
#[derive(Debug)]
pub struct BodyCapture {
    buf: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.buf.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.buf = BytesMut::new();
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn finish(self) -> Option<Bytes> {
        (!self.overflowed).then(|| self.buf.freeze())
    }
}

/// Live traffic counters of one origin socket
#[derive(Debug, Default)]
pub struct SocketCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Epoch millis of the first non-empty read, 0 until then
    first_byte_at: AtomicI64,
}

impl SocketCounters {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn first_byte_at(&self) -> Option<i64> {
        match self.first_byte_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    fn on_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .first_byte_at
            .compare_exchange(0, now_millis(), Ordering::Relaxed, Ordering::Relaxed);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn on_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Counts the bytes moved through an origin socket.
pub struct CountingIo<T> {
    inner: T,
    counters: Arc<SocketCounters>,
}

impl<T> CountingIo<T> {
    pub fn new(inner: T, counters: Arc<SocketCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CountingIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            self.counters.on_read(buf.filled().len() - before);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CountingIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.counters.on_write(n);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = result {
            self.counters.on_write(n);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Header lines of a head as they appeared on the wire
pub type RawHeaders = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retain {
    /// Stop recording once full
    Oldest,
    /// Drop the oldest bytes once full
    Newest,
}

/// Bounded copy of the bytes read from one HTTP/1 leg, from which the
/// message heads are recovered with their original header casing.
#[derive(Clone)]
pub struct HeadLog {
    buf: Arc<Mutex<Vec<u8>>>,
    recording: Arc<AtomicBool>,
    limit: usize,
    retain: Retain,
}

impl HeadLog {
    /// Log for an origin leg, cleared before every request.
    pub fn keep_oldest(limit: usize) -> Self {
        Self::new(limit, Retain::Oldest)
    }

    /// Log for a browser leg, trimmed as each request head is taken.
    pub fn keep_newest(limit: usize) -> Self {
        Self::new(limit, Retain::Newest)
    }

    fn new(limit: usize, retain: Retain) -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            recording: Arc::new(AtomicBool::new(true)),
            limit,
            retain,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, data: &[u8]) {
        if data.is_empty() || !self.recording.load(Ordering::Relaxed) {
            return;
        }
        let mut buf = self.lock();
        match self.retain {
            Retain::Oldest => {
                let room = self.limit.saturating_sub(buf.len());
                buf.extend_from_slice(&data[..data.len().min(room)]);
            }
            Retain::Newest => {
                let data = &data[data.len().saturating_sub(self.limit)..];
                let overflow = (buf.len() + data.len()).saturating_sub(self.limit);
                buf.drain(..overflow);
                buf.extend_from_slice(data);
            }
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Stop recording for good, once the connection no longer speaks HTTP/1.
    pub fn stop(&self) {
        self.recording.store(false, Ordering::Relaxed);
        self.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Headers of the request head starting with `method target HTTP/1.x`.
    /// Everything up to the end of that head is consumed.
    pub fn take_request_head(&self, method: &str, target: &str) -> Option<RawHeaders> {
        let needle = format!("{} {} HTTP/1.", method, target);
        let mut buf = self.lock();
        let start = find_at_line_start(&buf, needle.as_bytes())?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEAD_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let httparse::Status::Complete(len) = request.parse(&buf[start..]).ok()? else {
            return None;
        };
        let raw = raw_headers(request.headers);
        buf.drain(..start + len);
        Some(raw)
    }

    /// Headers of the first response head with `status`, skipping interim
    /// `1xx` heads.
    pub fn take_response_head(&self, status: u16) -> Option<RawHeaders> {
        let mut buf = self.lock();
        let mut offset = find_at_line_start(&buf, b"HTTP/1.")?;
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEAD_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            let httparse::Status::Complete(len) = response.parse(&buf[offset..]).ok()? else {
                return None;
            };
            match response.code {
                Some(code) if code == status => {
                    let raw = raw_headers(response.headers);
                    buf.clear();
                    return Some(raw);
                }
                Some(code) if (100..200).contains(&code) => offset += len,
                _ => return None,
            }
        }
    }
}

fn find_at_line_start(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        (i == 0 || haystack[i - 1] == b'\n') && haystack[i..].starts_with(needle)
    })
}

fn raw_headers(headers: &[httparse::Header<'_>]) -> RawHeaders {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

/// Records everything read from the inner stream into a `HeadLog`.
pub struct HeadTap<T> {
    inner: T,
    log: HeadLog,
}

impl<T> HeadTap<T> {
    pub fn new(inner: T, log: HeadLog) -> Self {
        Self { inner, log }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for HeadTap<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            self.log.record(&buf.filled()[before..]);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for HeadTap<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
