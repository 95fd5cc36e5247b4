//! Bounded, buffer-reusing byte transfer between a source and a sink.
//!
//! [`copy_bounded`] moves bytes from any [`ByteSource`] into any [`ByteSink`] using a caller
//! provided buffer, optionally stopping after a fixed number of bytes. Both traits are
//! implemented for all tokio [`AsyncRead`]/[`AsyncWrite`] types, and [`BodySender`] adapts the
//! sending half of an HTTP response body.
//!
//! The copier holds no state beyond a single call and is meant for single-pass use.

use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Default size of the transfer buffer used for streaming responses.
pub const STREAM_BUFFER_SIZE: usize = 32 * 1024;

/// A readable source of bytes.
pub trait ByteSource {
    /// Reads into `buf` and returns the number of bytes read. `0` signals end of input.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl<T> ByteSource for T
where
    T: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }
}

/// A writable destination for bytes.
pub trait ByteSink {
    /// Writes a prefix of `buf` and returns how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl<T> ByteSink for T
where
    T: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriteExt::write(self, buf).await
    }
}

/// Sends written chunks into a response body channel.
///
/// Pair with [`body_channel`]. Once the receiving end is dropped (the client went away), every
/// write fails with [`io::ErrorKind::BrokenPipe`].
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl BodySender {
    /// Forwards a transfer failure to the receiving body, aborting the response.
    ///
    /// Returns `false` if the receiver is already gone.
    pub async fn abort(&self, error: io::Error) -> bool {
        self.tx.send(Err(error)).await.is_ok()
    }
}

impl ByteSink for BodySender {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Ok(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body closed"))?;
        Ok(buf.len())
    }
}

/// Creates a bounded channel whose receiver can be used as a response body stream.
pub fn body_channel(capacity: usize) -> (BodySender, mpsc::Receiver<io::Result<Bytes>>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BodySender { tx }, rx)
}

/// Which side of a copy failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySide {
    /// Reading from the source failed.
    Read,
    /// Writing to the sink failed.
    Write,
}

/// A failed copy, including the number of bytes that made it to the sink before the failure.
#[derive(Debug, Error)]
#[error("{side:?} failed after {written} bytes: {source}")]
pub struct CopyError {
    /// The side that failed.
    pub side: CopySide,
    /// Bytes successfully written before the failure.
    pub written: u64,
    /// The underlying I/O error.
    #[source]
    pub source: io::Error,
}

impl CopyError {
    /// Returns `true` if the sink went away, typically a disconnected client.
    pub fn is_disconnect(&self) -> bool {
        self.side == CopySide::Write
            && matches!(
                self.source.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            )
    }
}

/// Copies bytes from `src` to `dst` through `buf`, stopping after `limit` bytes if given.
///
/// Returns the number of bytes written. End of input before the limit ends the copy
/// successfully with fewer bytes; callers compare against the expected length. Every partially
/// written chunk counts towards the total, also when reported in a [`CopyError`].
///
/// # Panics
///
/// Panics if `buf` is empty.
pub async fn copy_bounded<D, S>(
    dst: &mut D,
    src: &mut S,
    buf: &mut [u8],
    limit: Option<u64>,
) -> Result<u64, CopyError>
where
    D: ByteSink + ?Sized,
    S: ByteSource + ?Sized,
{
    assert!(!buf.is_empty(), "copy buffer must not be empty");

    let mut written = 0u64;
    loop {
        let mut chunk = buf.len();
        if let Some(limit) = limit {
            let remaining = limit - written;
            if remaining == 0 {
                break;
            }
            chunk = chunk.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let read = match src.read(&mut buf[..chunk]).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(CopyError {
                    side: CopySide::Read,
                    written,
                    source,
                });
            }
        };

        let mut offset = 0;
        while offset < read {
            match dst.write(&buf[offset..read]).await {
                Ok(0) => {
                    return Err(CopyError {
                        side: CopySide::Write,
                        written,
                        source: io::ErrorKind::WriteZero.into(),
                    });
                }
                Ok(n) => {
                    offset += n;
                    written += n as u64;
                }
                Err(source) => {
                    return Err(CopyError {
                        side: CopySide::Write,
                        written,
                        source,
                    });
                }
            }
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    /// A sink that accepts `capacity` bytes, then fails.
    struct FailingSink {
        accepted: Vec<u8>,
        capacity: usize,
    }

    impl ByteSink for FailingSink {
        async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity - self.accepted.len();
            if room == 0 {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    /// A source that yields its data, then a non-EOF error.
    struct FailingSource {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for FailingSource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::other("origin reset"))),
            }
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn copies_everything_without_limit() {
        let data = sample(100_000);
        let mut src = data.as_slice();
        let mut dst = Vec::new();
        let mut buf = vec![0; 4096];

        let written = copy_bounded(&mut dst, &mut src, &mut buf, None).await.unwrap();

        assert_eq!(written, 100_000);
        assert_eq!(dst, data);
    }

    #[tokio::test]
    async fn never_reads_past_limit() {
        let data = sample(10_000);
        let mut src = data.as_slice();
        let mut dst = Vec::new();
        let mut buf = vec![0; 4096];

        let written = copy_bounded(&mut dst, &mut src, &mut buf, Some(5000))
            .await
            .unwrap();

        assert_eq!(written, 5000);
        assert_eq!(dst, &data[..5000]);
        // The remainder is still unread in the source.
        assert_eq!(src.len(), 5000);
    }

    #[tokio::test]
    async fn short_source_is_not_an_error() {
        let data = sample(300);
        let mut src = data.as_slice();
        let mut dst = Vec::new();
        let mut buf = vec![0; 64];

        let written = copy_bounded(&mut dst, &mut src, &mut buf, Some(1000))
            .await
            .unwrap();

        assert_eq!(written, 300);
    }

    #[tokio::test]
    async fn zero_limit_copies_nothing() {
        let mut src: &[u8] = b"hello";
        let mut dst = Vec::new();
        let mut buf = vec![0; 8];

        let written = copy_bounded(&mut dst, &mut src, &mut buf, Some(0))
            .await
            .unwrap();

        assert_eq!(written, 0);
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn write_failure_reports_partial_progress() {
        let data = sample(1000);
        let mut src = data.as_slice();
        let mut dst = FailingSink {
            accepted: Vec::new(),
            capacity: 150,
        };
        let mut buf = vec![0; 100];

        let err = copy_bounded(&mut dst, &mut src, &mut buf, None)
            .await
            .unwrap_err();

        assert_eq!(err.side, CopySide::Write);
        assert_eq!(err.written, 150);
        assert!(err.is_disconnect());
        assert_eq!(dst.accepted, &data[..150]);
    }

    #[tokio::test]
    async fn read_failure_is_propagated() {
        let mut src = FailingSource {
            data: Some(b"partial".to_vec()),
        };
        let mut dst = Vec::new();
        let mut buf = vec![0; 64];

        let err = copy_bounded(&mut dst, &mut src, &mut buf, None)
            .await
            .unwrap_err();

        assert_eq!(err.side, CopySide::Read);
        assert_eq!(err.written, 7);
        assert!(!err.is_disconnect());
        assert_eq!(dst, b"partial");
    }

    #[tokio::test]
    async fn body_sender_fails_once_receiver_is_gone() {
        let (mut sender, mut rx) = body_channel(4);

        let mut src: &[u8] = b"first";
        let mut buf = vec![0; 16];
        copy_bounded(&mut sender, &mut src, &mut buf, None)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().as_ref(), b"first");

        drop(rx);
        let mut src: &[u8] = b"second";
        let err = copy_bounded(&mut sender, &mut src, &mut buf, None)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(err.written, 0);
    }
}
