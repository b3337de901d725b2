//! Length-prefixed frame codec.
//!
//! Each frame is a 6-character lowercase hex byte length followed by exactly
//! that many bytes of UTF-8 s-expression text ending in `\n` (the newline is
//! counted). Framing is the only place the byte stream is interpreted; above
//! it everything is [`Sexp`]/[`Message`].
//!
//! Generic over the transport halves — anything `AsyncRead`/`AsyncWrite`
//! works, including `TcpStream` halves and `tokio::io::duplex` pipes.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::sexp::{self, Sexp, SexpError};
use crate::wire::Message;

/// Bytes in the hex length header.
pub const HEADER_LEN: usize = 6;

/// Largest payload expressible in six hex digits.
pub const MAX_PAYLOAD: usize = 0xff_ffff;

const READ_CHUNK: usize = 4096;
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Error while framing or deframing.
#[derive(Debug)]
pub enum FrameError {
    /// Unusable length header. The stream cannot be re-synchronized.
    Header { reason: &'static str },
    /// Frame payload was not valid UTF-8. The buffer has already advanced.
    Encoding,
    /// Frame payload was not a readable s-expression. The buffer has already
    /// advanced.
    Payload(SexpError),
    /// Outgoing payload does not fit in six hex digits.
    TooLarge { len: usize },
    /// Underlying transport failure.
    Io(io::Error),
}

impl FrameError {
    /// Fatal errors leave the stream unusable; recoverable ones consumed a
    /// whole (bad) frame and the next frame can still be read.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::Header { .. } | FrameError::TooLarge { .. } | FrameError::Io(_)
        )
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Header { reason } => write!(f, "bad frame header: {reason}"),
            FrameError::Encoding => write!(f, "frame payload is not UTF-8"),
            FrameError::Payload(e) => write!(f, "unreadable frame payload: {e}"),
            FrameError::TooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds {MAX_PAYLOAD}")
            }
            FrameError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Encode one payload into a complete frame.
pub fn encode_frame(payload: &Sexp) -> Result<Vec<u8>, FrameError> {
    let mut text = payload.to_string();
    text.push('\n');
    let body = text.into_bytes();
    if body.len() > MAX_PAYLOAD {
        return Err(FrameError::TooLarge { len: body.len() });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(format!("{:06x}", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to decode one frame from `buf[*unread_start..]`.
///
/// Returns `Ok(None)` while the buffer holds no complete frame. On a
/// recoverable payload error the consumed offset has already moved past the
/// declared frame length, so the caller can keep draining.
pub(crate) fn decode_one(
    buf: &mut Vec<u8>,
    unread_start: &mut usize,
) -> Result<Option<Sexp>, FrameError> {
    let avail = buf.len() - *unread_start;
    if avail < HEADER_LEN {
        return Ok(None);
    }
    let header = &buf[*unread_start..*unread_start + HEADER_LEN];
    let header = std::str::from_utf8(header).map_err(|_| FrameError::Header {
        reason: "header is not ASCII hex",
    })?;
    let len = usize::from_str_radix(header, 16).map_err(|_| FrameError::Header {
        reason: "header is not ASCII hex",
    })?;
    if len == 0 {
        return Err(FrameError::Header {
            reason: "zero-length frame",
        });
    }
    if avail - HEADER_LEN < len {
        return Ok(None);
    }

    let start = *unread_start + HEADER_LEN;
    let body = buf[start..start + len].to_vec();
    *unread_start += HEADER_LEN + len;
    compact(buf, unread_start);

    let text = std::str::from_utf8(&body).map_err(|_| FrameError::Encoding)?;
    let value = sexp::parse(text).map_err(FrameError::Payload)?;
    Ok(Some(value))
}

fn compact(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
    } else if *unread_start >= COMPACT_THRESHOLD {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

/// Buffered frame reader over an async byte stream.
pub struct FrameReader<R> {
    stream: R,
    buf: Vec<u8>,
    unread_start: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
            unread_start: 0,
        }
    }

    /// Read the next frame's payload.
    ///
    /// `Ok(None)` means the stream closed cleanly between frames. Recoverable
    /// errors may be followed by further successful reads.
    pub async fn read_message(&mut self) -> Result<Option<Sexp>, FrameError> {
        loop {
            if let Some(value) = decode_one(&mut self.buf, &mut self.unread_start)? {
                return Ok(Some(value));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if trailing != 0 {
                    tracing::debug!(trailing, "stream closed mid-frame");
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Frame writer over an async byte stream.
pub struct FrameWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        FrameWriter { stream }
    }

    /// Encode and write one message as a single frame.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), FrameError> {
        let frame = encode_frame(&message.to_sexp())?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
