//! Frame I/O over a raw byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by the payload, so the largest frame a byte stream can carry is
//! `u32::MAX` bytes.

use crate::errors::StreamError;
use crate::transport::FrameStream;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::*;

const INITIAL_FRAME_CAPACITY: usize = 64 * 1024;

pub struct FramedStream<T> {
    inner: T,
}

impl<T> FramedStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T> FrameStream for FramedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self, max_len: usize) -> Result<Vec<u8>, StreamError> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await.map_err(StreamError::from_io)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_len {
            return Err(StreamError::FrameTooLarge { len, max: max_len });
        }
        // Grow with the bytes that actually arrive; the header alone must not reserve `len` bytes.
        let mut frame = Vec::with_capacity(len.min(INITIAL_FRAME_CAPACITY));
        (&mut self.inner).take(len as u64).read_to_end(&mut frame).await.map_err(StreamError::from_io)?;
        if frame.len() < len {
            trace!("Stream ended {} bytes into a {len} byte frame", frame.len());
            return Err(StreamError::Closed);
        }
        Ok(frame)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), StreamError> {
        let len = u32::try_from(frame.len())
            .map_err(|_| StreamError::FrameTooLarge { len: frame.len(), max: u32::MAX as usize })?;
        self.inner.write_all(&len.to_be_bytes()).await.map_err(StreamError::from_io)?;
        self.inner.write_all(frame).await.map_err(StreamError::from_io)?;
        self.inner.flush().await.map_err(StreamError::from_io)?;
        Ok(())
    }

    async fn reset(&mut self) {
        if let Err(err) = self.inner.close().await {
            trace!("Error while closing a framed stream: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message_types::MAX_READ_LEN;
    use futures::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[tokio::test]
    async fn frames_are_length_prefixed() {
        let mut stream = FramedStream::new(Cursor::new(Vec::new()));
        stream.write_frame(b"{\"command\":\"hello\"}").await.unwrap();
        stream.write_frame(b"").await.unwrap();
        let bytes = stream.into_inner().into_inner();
        assert_eq!(&bytes[..4], &19u32.to_be_bytes());
        assert_eq!(&bytes[4..23], b"{\"command\":\"hello\"}");
        assert_eq!(&bytes[23..], &0u32.to_be_bytes());

        let mut stream = FramedStream::new(Cursor::new(bytes));
        assert_eq!(stream.read_frame(1024).await.unwrap(), b"{\"command\":\"hello\"}");
        assert!(stream.read_frame(1024).await.unwrap().is_empty());
        assert!(matches!(stream.read_frame(1024).await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let mut bytes = 64u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[b'x'; 64]);
        let mut stream = FramedStream::new(Cursor::new(bytes));
        match stream.read_frame(16).await {
            Err(StreamError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 64);
                assert_eq!(max, 16);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    /// Hands out the bytes of a cursor and remembers the largest read buffer it was offered.
    struct MeasuredReader {
        data: Cursor<Vec<u8>>,
        largest_read: Arc<AtomicUsize>,
    }

    impl AsyncRead for MeasuredReader {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
            self.largest_read.fetch_max(buf.len(), Ordering::SeqCst);
            Pin::new(&mut self.data).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MeasuredReader {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn bare_header_does_not_reserve_the_announced_length() {
        let gib = 1u32 << 30;
        let largest_read = Arc::new(AtomicUsize::new(0));
        let reader = MeasuredReader { data: Cursor::new(gib.to_be_bytes().to_vec()), largest_read: Arc::clone(&largest_read) };
        let mut stream = FramedStream::new(reader);
        assert!(matches!(stream.read_frame(MAX_READ_LEN).await, Err(StreamError::Closed)));
        assert!(largest_read.load(Ordering::SeqCst) <= INITIAL_FRAME_CAPACITY);
    }

    #[tokio::test]
    async fn large_frames_still_arrive_whole() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(3 * INITIAL_FRAME_CAPACITY + 17).collect();
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        let mut stream = FramedStream::new(Cursor::new(bytes));
        assert_eq!(stream.read_frame(MAX_READ_LEN).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn truncated_frame_reads_as_closed() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        let mut stream = FramedStream::new(Cursor::new(bytes));
        assert!(matches!(stream.read_frame(1024).await, Err(StreamError::Closed)));
    }
}
