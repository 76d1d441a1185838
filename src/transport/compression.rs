//! # Compression Layer
//!
//! A zlib stream wrapped around the connection once both peers agree on the
//! Compression feature. Unlike per-message compression this is one continuous
//! DEFLATE stream per direction, so history carries across frames.
//!
//! Every `flush` ends with a zlib sync flush. That makes the bytes written so
//! far decodable by the core right away, which is what a request/response
//! protocol needs.

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::error::ProtocolError;

const READ_CHUNK: usize = 8 * 1024;

pub struct DeflateStream<S> {
    inner: S,
    compress: Compress,
    decompress: Decompress,
    /// Compressed bytes read from `inner` and not yet inflated
    read_buf: BytesMut,
    read_eof: bool,
    /// Compressed bytes not yet written to `inner`
    write_buf: Vec<u8>,
    sync_pending: bool,
}

impl<S> DeflateStream<S> {
    pub fn new(inner: S, level: u32) -> Self {
        Self {
            inner,
            compress: Compress::new(Compression::new(level.min(9)), true),
            decompress: Decompress::new(true),
            read_buf: BytesMut::new(),
            read_eof: false,
            write_buf: Vec::new(),
            sync_pending: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Uncompressed bytes written and read so far.
    pub fn totals(&self) -> (u64, u64) {
        (self.compress.total_in(), self.decompress.total_out())
    }
}

fn compression_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        ProtocolError::CompressionFailure(e.to_string()),
    )
}

fn decompression_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        ProtocolError::DecompressionFailure(e.to_string()),
    )
}

impl<S: AsyncRead + Unpin> AsyncRead for DeflateStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.read_buf.is_empty() || this.read_eof {
                let before_in = this.decompress.total_in();
                let before_out = this.decompress.total_out();
                let status = this
                    .decompress
                    .decompress(
                        &this.read_buf,
                        buf.initialize_unfilled(),
                        FlushDecompress::Sync,
                    )
                    .map_err(decompression_error)?;
                let consumed = (this.decompress.total_in() - before_in) as usize;
                let produced = (this.decompress.total_out() - before_out) as usize;
                this.read_buf.advance(consumed);
                buf.advance(produced);

                if produced > 0 || this.read_eof || status == Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
                if consumed > 0 {
                    continue;
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.read_eof = true;
            } else {
                this.read_buf.extend_from_slice(chunk_buf.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> DeflateStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.drain(..written);
        }
        Poll::Ready(Ok(()))
    }

    fn sync_flush(&mut self) -> io::Result<()> {
        // Done once a call leaves spare output room.
        loop {
            self.write_buf.reserve(64);
            self.compress
                .compress_vec(&[], &mut self.write_buf, FlushCompress::Sync)
                .map_err(compression_error)?;
            if self.write_buf.len() < self.write_buf.capacity() {
                break;
            }
        }
        self.sync_pending = false;
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeflateStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let start = this.compress.total_in();
        loop {
            let consumed = (this.compress.total_in() - start) as usize;
            if consumed >= data.len() {
                break;
            }
            this.write_buf.reserve(data.len() - consumed + 64);
            this.compress
                .compress_vec(&data[consumed..], &mut this.write_buf, FlushCompress::None)
                .map_err(compression_error)?;
        }
        this.sync_pending = true;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.sync_pending {
            this.sync_flush()?;
            trace!(pending = this.write_buf.len(), "Deflate sync flush");
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn output_is_zlib_wrapped() {
        let mut stream = DeflateStream::new(Vec::new(), 6);
        stream.write_all(b"hello hello hello").await.unwrap();
        stream.flush().await.unwrap();
        let raw = stream.into_inner();
        assert_eq!(raw[0], 0x78);
        // Sync flush marker
        assert!(raw.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    }

    #[tokio::test]
    async fn each_flush_is_decodable_immediately() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = DeflateStream::new(a, 6);
        let mut reader = DeflateStream::new(b, 6);

        for message in [&b"first frame"[..], &b"second, longer frame with more bytes"[..]] {
            writer.write_all(message).await.unwrap();
            writer.flush().await.unwrap();
            let mut received = vec![0u8; message.len()];
            reader.read_exact(&mut received).await.unwrap();
            assert_eq!(received, message);
        }
    }

    #[tokio::test]
    async fn large_payloads_survive() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (a, b) = tokio::io::duplex(16 * 1024);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            let mut writer = DeflateStream::new(a, 9);
            writer.write_all(&payload).await.unwrap();
            writer.flush().await.unwrap();
            writer
        });
        let mut reader = DeflateStream::new(b, 9);
        let mut received = vec![0u8; expected.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        let writer = writer.await.unwrap();
        assert_eq!(writer.totals().0, expected.len() as u64);
    }

    #[tokio::test]
    async fn garbage_is_a_decompression_error() {
        let garbage: &[u8] = &[0x12, 0x34, 0x56, 0x78, 0x9a];
        let mut reader = DeflateStream::new(garbage, 6);
        let mut out = [0u8; 16];
        let err = reader.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
