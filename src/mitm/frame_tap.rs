//! HTTP/2 frame observer
//!
//! `h2` answers PINGs itself and drops frame types it does not implement,
//! ALTSVC (RFC 7838) and ORIGIN (RFC 8336) included. `FrameTap` reads the
//! frame headers of everything passing through one leg and reports those
//! frames before `h2` sees them. Bytes are never altered.

use crate::mitm::http2_binding::Http2Event;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Connection preface a browser sends before its first frame
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const FRAME_PING: u8 = 0x6;
const FRAME_ALTSVC: u8 = 0xa;
const FRAME_ORIGIN: u8 = 0xc;
const FLAG_ACK: u8 = 0x1;

/// Larger payloads of observed types are skipped
const MAX_OBSERVED_PAYLOAD: usize = 16 * 1024;

/// A frame `h2` would not surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedFrame {
    Ping { payload: [u8; 8], ack: bool },
    AltSvc { stream_id: u32, origin: String, value: String },
    Origin { origins: Vec<String> },
}

impl ObservedFrame {
    /// Binding event for a frame read from the browser
    pub fn into_client_event(self) -> Option<Http2Event> {
        match self {
            ObservedFrame::Ping { payload, ack: false } => Some(Http2Event::ClientPing { payload }),
            _ => None,
        }
    }

    /// Binding event for a frame read from the origin. An ALTSVC frame on
    /// a stream applies to `origin`.
    pub fn into_origin_event(self, origin: &str) -> Option<Http2Event> {
        match self {
            ObservedFrame::AltSvc { origin: named, value, .. } => Some(Http2Event::AltSvc {
                origin: if named.is_empty() { origin.to_string() } else { named },
                alt: value,
            }),
            ObservedFrame::Origin { origins } => Some(Http2Event::Origin { origins }),
            ObservedFrame::Ping { .. } => None,
        }
    }
}

struct PartialFrame {
    kind: u8,
    flags: u8,
    stream_id: u32,
    remaining: usize,
    /// `None` when the payload is skipped
    payload: Option<Vec<u8>>,
}

/// Incremental frame splitter
pub struct FrameParser {
    preface: usize,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    current: Option<PartialFrame>,
}

impl FrameParser {
    /// Parser for bytes sent by a browser, starting with the preface
    pub fn client() -> Self {
        Self::with_preface(CLIENT_PREFACE.len())
    }

    /// Parser for bytes sent by an origin
    pub fn origin() -> Self {
        Self::with_preface(0)
    }

    fn with_preface(preface: usize) -> Self {
        Self {
            preface,
            header: [0; FRAME_HEADER_LEN],
            header_len: 0,
            current: None,
        }
    }

    pub fn feed(&mut self, mut data: &[u8]) -> Vec<ObservedFrame> {
        let mut observed = Vec::new();
        while !data.is_empty() {
            if self.preface > 0 {
                let skip = self.preface.min(data.len());
                self.preface -= skip;
                data = &data[skip..];
                continue;
            }

            let Some(frame) = self.current.as_mut() else {
                let take = (FRAME_HEADER_LEN - self.header_len).min(data.len());
                self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
                self.header_len += take;
                data = &data[take..];
                if self.header_len == FRAME_HEADER_LEN {
                    self.header_len = 0;
                    self.start_frame(&mut observed);
                }
                continue;
            };

            let take = frame.remaining.min(data.len());
            if let Some(payload) = frame.payload.as_mut() {
                payload.extend_from_slice(&data[..take]);
            }
            frame.remaining -= take;
            data = &data[take..];
            if frame.remaining == 0 {
                if let Some(done) = self.current.take().and_then(decode) {
                    observed.push(done);
                }
            }
        }
        observed
    }

    fn start_frame(&mut self, observed: &mut Vec<ObservedFrame>) {
        let h = &self.header;
        let len = u32::from_be_bytes([0, h[0], h[1], h[2]]) as usize;
        let kind = h[3];
        let keep = matches!(kind, FRAME_PING | FRAME_ALTSVC | FRAME_ORIGIN) && len <= MAX_OBSERVED_PAYLOAD;
        let frame = PartialFrame {
            kind,
            flags: h[4],
            stream_id: u32::from_be_bytes([h[5], h[6], h[7], h[8]]) & 0x7fff_ffff,
            remaining: len,
            payload: keep.then(|| Vec::with_capacity(len)),
        };
        if len == 0 {
            observed.extend(decode(frame));
        } else {
            self.current = Some(frame);
        }
    }
}

fn decode(frame: PartialFrame) -> Option<ObservedFrame> {
    let payload = frame.payload?;
    match frame.kind {
        FRAME_PING => {
            let payload: [u8; 8] = payload.as_slice().try_into().ok()?;
            Some(ObservedFrame::Ping {
                payload,
                ack: frame.flags & FLAG_ACK != 0,
            })
        }
        FRAME_ALTSVC => {
            let (origin, rest) = split_prefixed(&payload)?;
            Some(ObservedFrame::AltSvc {
                stream_id: frame.stream_id,
                origin,
                value: String::from_utf8_lossy(rest).into_owned(),
            })
        }
        FRAME_ORIGIN if frame.stream_id == 0 => {
            let mut origins = Vec::new();
            let mut rest = payload.as_slice();
            while !rest.is_empty() {
                let (origin, tail) = split_prefixed(rest)?;
                origins.push(origin);
                rest = tail;
            }
            Some(ObservedFrame::Origin { origins })
        }
        _ => None,
    }
}

/// Split a 16-bit length-prefixed string off the front of `data`.
fn split_prefixed(data: &[u8]) -> Option<(String, &[u8])> {
    let len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let value = data.get(2..2 + len)?;
    Some((String::from_utf8_lossy(value).into_owned(), &data[2 + len..]))
}

/// Reports observed frames read from the inner stream.
pub struct FrameTap<T> {
    inner: T,
    parser: FrameParser,
    on_frame: Box<dyn FnMut(ObservedFrame) + Send>,
}

impl<T> FrameTap<T> {
    pub fn new(inner: T, parser: FrameParser, on_frame: impl FnMut(ObservedFrame) + Send + 'static) -> Self {
        Self {
            inner,
            parser,
            on_frame: Box::new(on_frame),
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for FrameTap<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let this = &mut *self;
            for frame in this.parser.feed(&buf.filled()[before..]) {
                (this.on_frame)(frame);
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for FrameTap<T> {
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
