use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{decode_frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// `read_frame` is cancel-safe: bytes already read stay buffered for the next
/// call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when the peer closes or
    /// resets the stream, including in the middle of a frame.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(payload);
            }

            if self.buf.capacity() == self.buf.len() {
                self.buf.reserve(INITIAL_BUFFER_CAPACITY);
            }

            let read = match self.inner.read_buf(&mut self.buf).await {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::from_io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::BufMut;
    use tokio::io::ReadBuf;

    use super::*;
    use crate::codec::encode_frame;
    use crate::writer::FrameWriter;

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn read_single_frame() {
        let bytes = wire(&[b"hello"]);
        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn read_multiple_frames_in_order() {
        let bytes = wire(&[b"one", b"", b"three"]);
        let mut reader = FrameReader::new(bytes.as_slice());

        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"one");
        assert!(reader.read_frame().await.unwrap().is_empty());
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"three");
    }

    #[tokio::test]
    async fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(&[&payload]);
        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[b"slow"]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"slow");
    }

    #[tokio::test]
    async fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(&b""[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_u32_le(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(&partial[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn reset_by_peer_is_connection_closed() {
        let mut reader = FrameReader::new(FailingReader(ErrorKind::ConnectionReset));
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn other_io_faults_propagate() {
        let mut reader = FrameReader::new(FailingReader(ErrorKind::PermissionDenied));
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn oversized_frame_in_stream() {
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(1024);

        let cfg = FrameConfig {
            max_payload_size: 16,
        };
        let mut reader = FrameReader::with_config(&bytes[..], cfg);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (left, right) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let producer = tokio::spawn(async move {
            for i in 0..64u32 {
                writer.write_frame(format!("msg-{i}").as_bytes()).await.unwrap();
            }
        });

        for i in 0..64u32 {
            let frame = reader.read_frame().await.unwrap();
            assert_eq!(frame.as_ref(), format!("msg-{i}").as_bytes());
        }
        producer.await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn roundtrip_over_pipe_stream() {
        let (left, right) = duplexpipe_transport::PipeStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.write_frame(b"ping").await.unwrap();
        writer.write_frame(b"").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"ping");
        assert!(reader.read_frame().await.unwrap().is_empty());

        drop(writer);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn accessors_and_into_inner() {
        let mut reader = FrameReader::new(&b""[..]);
        reader.set_max_payload_size(8);
        assert_eq!(reader.config().max_payload_size, 8);
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for ByteByByteReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.pos < self.bytes.len() && buf.remaining() > 0 {
                let byte = self.bytes[self.pos];
                buf.put_slice(&[byte]);
                self.pos += 1;
            }
            Poll::Ready(Ok(()))
        }
    }

    struct FailingReader(ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::from(self.0)))
        }
    }
}
