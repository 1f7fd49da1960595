//! Peekable byte sources.
//!
//! Both header formats are decoded by looking ahead at buffered bytes and only
//! committing them once the whole header has been validated. [PeekSource] is
//! the capability the decoders need; [PeekableStream] provides it on top of
//! any Tokio reader, typically an accepted [tokio::net::TcpStream].
//!
//! Every method that may need more data from the transport honours the read
//! deadline set through [PeekSource::set_read_deadline].

use bytes::{Buf as _, Bytes, BytesMut};
use snafu::{ensure, ResultExt as _, Snafu};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf},
    time::{timeout_at, Instant},
};

/// The largest header either format can produce: the 16 byte v2 preamble and
/// the largest length it can declare.
pub const MAX_BUFFERED: usize = 16 + u16::MAX as usize;

const INITIAL_CAPACITY: usize = 256;

#[derive(Debug, Snafu)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum ReadError {
    #[snafu(display("the read deadline expired"))]
    Timeout,

    #[snafu(display("the stream was closed"))]
    Eof,

    #[snafu(display("could not read from the stream: {}", source))]
    Io { source: io::Error },

    #[snafu(display("no delimiter within {} bytes", limit))]
    LimitExceeded { limit: usize },
}

/// Look-ahead access to the start of a connection.
///
/// A source has two positions: the committed position (the next byte a plain
/// read would return) and the peek cursor. Peeking moves only the cursor;
/// bytes are dropped solely through [PeekSource::consume].
#[allow(async_fn_in_trait)]
pub trait PeekSource {
    /// Bounds every read issued by subsequent peeks. `None` waits forever.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Returns every buffered byte from the peek cursor on, reading until at
    /// least `min` are available. The cursor does not move.
    async fn peek(&mut self, min: usize) -> Result<&[u8], ReadError>;

    /// Returns the next `len` bytes and moves the cursor past them.
    async fn peek_exact(&mut self, len: usize) -> Result<&[u8], ReadError>;

    /// Returns the bytes up to the first occurrence of any of `delimiters`,
    /// and the index of the delimiter found. The cursor moves past the
    /// delimiter.
    ///
    /// The span and its delimiter together may not exceed `limit` bytes.
    async fn peek_until(
        &mut self,
        delimiters: &[&[u8]],
        limit: usize,
    ) -> Result<(&[u8], usize), ReadError>;

    /// Number of bytes between the committed position and the peek cursor.
    fn peeked(&self) -> usize;

    /// Drops `len` bytes from the front of the stream.
    fn consume(&mut self, len: usize);

    /// Moves the peek cursor back to the committed position.
    fn rewind(&mut self);
}

/// A [PeekSource] over a Tokio reader.
///
/// Once the header has been read, the stream can be used in place of the
/// wrapped one: reads return the remaining buffered bytes before falling
/// through to the inner reader, and writes are forwarded untouched.
#[derive(Debug)]
pub struct PeekableStream<R> {
    inner: R,
    buf: BytesMut,
    cursor: usize,
    deadline: Option<Instant>,
}

impl<R> PeekableStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            cursor: 0,
            deadline: None,
        }
    }

    /// The buffered bytes not consumed yet.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Returns the buffered bytes not consumed yet, and the inner reader.
    pub fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> PeekableStream<R> {
    async fn buffer_more(&mut self) -> Result<usize, ReadError> {
        let max = MAX_BUFFERED.saturating_sub(self.buf.len());
        ensure!(max > 0, LimitExceeded { limit: MAX_BUFFERED });

        let mut limited = (&mut self.inner).take(max as u64);
        let read = limited.read_buf(&mut self.buf);
        let read = match self.deadline {
            Some(deadline) => match timeout_at(deadline, read).await {
                Ok(read) => read,
                Err(_) => return Timeout.fail(),
            },
            None => read.await,
        };

        let n = read.context(Io)?;
        ensure!(n > 0, Eof);
        Ok(n)
    }

    async fn fill_to(&mut self, len: usize) -> Result<(), ReadError> {
        ensure!(len <= MAX_BUFFERED, LimitExceeded { limit: MAX_BUFFERED });
        while self.buf.len() < len {
            self.buffer_more().await?;
        }
        Ok(())
    }
}

fn find_delimiter(haystack: &[u8], delimiters: &[&[u8]]) -> Option<(usize, usize)> {
    (0..haystack.len()).find_map(|pos| {
        delimiters
            .iter()
            .position(|delimiter| haystack[pos..].starts_with(delimiter))
            .map(|which| (pos, which))
    })
}

impl<R: AsyncRead + Unpin> PeekSource for PeekableStream<R> {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    async fn peek(&mut self, min: usize) -> Result<&[u8], ReadError> {
        self.fill_to(self.cursor + min).await?;
        Ok(&self.buf[self.cursor..])
    }

    async fn peek_exact(&mut self, len: usize) -> Result<&[u8], ReadError> {
        let start = self.cursor;
        self.fill_to(start + len).await?;
        self.cursor += len;
        Ok(&self.buf[start..start + len])
    }

    async fn peek_until(
        &mut self,
        delimiters: &[&[u8]],
        limit: usize,
    ) -> Result<(&[u8], usize), ReadError> {
        debug_assert!(delimiters.iter().all(|delimiter| !delimiter.is_empty()));

        let start = self.cursor;
        let bound = start.saturating_add(limit);
        let (len, which) = loop {
            let window = &self.buf[start..self.buf.len().min(bound)];
            if let Some(found) = find_delimiter(window, delimiters) {
                break found;
            }
            ensure!(self.buf.len() < bound, LimitExceeded { limit });
            self.buffer_more().await?;
        };

        self.cursor = start + len + delimiters[which].len();
        Ok((&self.buf[start..start + len], which))
    }

    fn peeked(&self) -> usize {
        self.cursor
    }

    fn consume(&mut self, len: usize) {
        let len = len.min(self.buf.len());
        self.buf.advance(len);
        self.cursor = self.cursor.saturating_sub(len);
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekableStream<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            self.cursor = self.cursor.saturating_sub(n);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PeekableStream<R> {
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
