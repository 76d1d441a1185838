//! Connection stream with optional TLS and compression layers.
//!
//! Layers stack in one direction only: plain, then TLS, then compression.
//! Each upgrade consumes the stream and returns the wrapped one, so a
//! downgrade cannot be expressed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument};

use crate::error::{constants, ProtocolError, Result};
use crate::transport::compression::DeflateStream;
use crate::transport::tls::{TlsClientConfig, TlsInfo};

pub enum LayeredStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Compressed(Box<DeflateStream<S>>),
    CompressedTls(Box<DeflateStream<TlsStream<S>>>),
}

impl<S> LayeredStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        LayeredStream::Plain(stream)
    }

    /// Upgrade to TLS. Only valid on a plain stream.
    #[instrument(skip_all)]
    pub async fn enable_tls(self, config: &TlsClientConfig) -> Result<Self> {
        match self {
            LayeredStream::Plain(stream) => {
                let tls = config.connect(stream).await?;
                Ok(LayeredStream::Tls(Box::new(tls)))
            }
            LayeredStream::Tls(_) => Err(ProtocolError::TransportError(
                constants::ERR_TLS_ALREADY_ENABLED.into(),
            )),
            LayeredStream::Compressed(_) | LayeredStream::CompressedTls(_) => Err(
                ProtocolError::TransportError(constants::ERR_TLS_AFTER_COMPRESSION.into()),
            ),
        }
    }

    /// Wrap the current stream in a zlib layer.
    pub fn enable_compression(self, level: u32) -> Result<Self> {
        let upgraded = match self {
            LayeredStream::Plain(stream) => {
                LayeredStream::Compressed(Box::new(DeflateStream::new(stream, level)))
            }
            LayeredStream::Tls(tls) => {
                LayeredStream::CompressedTls(Box::new(DeflateStream::new(*tls, level)))
            }
            LayeredStream::Compressed(_) | LayeredStream::CompressedTls(_) => {
                return Err(ProtocolError::TransportError(
                    constants::ERR_COMPRESSION_ALREADY_ENABLED.into(),
                ))
            }
        };
        debug!(level, "Compression enabled");
        Ok(upgraded)
    }
}

impl<S> LayeredStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, LayeredStream::Tls(_) | LayeredStream::CompressedTls(_))
    }

    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            LayeredStream::Compressed(_) | LayeredStream::CompressedTls(_)
        )
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            LayeredStream::Tls(tls) => Some(TlsInfo::from_stream(tls.as_ref())),
            LayeredStream::CompressedTls(stream) => Some(TlsInfo::from_stream(stream.get_ref())),
            _ => None,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for LayeredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LayeredStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LayeredStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            LayeredStream::Compressed(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            LayeredStream::CompressedTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for LayeredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LayeredStream::Plain(s) => Pin::new(s).poll_write(cx, data),
            LayeredStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            LayeredStream::Compressed(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            LayeredStream::CompressedTls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LayeredStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LayeredStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            LayeredStream::Compressed(s) => Pin::new(s.as_mut()).poll_flush(cx),
            LayeredStream::CompressedTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LayeredStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LayeredStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            LayeredStream::Compressed(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            LayeredStream::CompressedTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn compression_cannot_be_enabled_twice() {
        let (a, _b) = tokio::io::duplex(1024);
        let stream = LayeredStream::new(a).enable_compression(6).unwrap();
        assert!(stream.is_compressed());
        assert!(!stream.is_tls());
        assert!(matches!(
            stream.enable_compression(6),
            Err(ProtocolError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn tls_after_compression_is_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let stream = LayeredStream::new(a).enable_compression(6).unwrap();
        let config = TlsClientConfig::new("localhost").insecure();
        match stream.enable_tls(&config).await {
            Err(ProtocolError::TransportError(msg)) => {
                assert_eq!(msg, constants::ERR_TLS_AFTER_COMPRESSION)
            }
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("TLS enabled after compression"),
        }
    }

    #[tokio::test]
    async fn compressed_layers_talk_to_each_other() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = LayeredStream::new(a).enable_compression(6).unwrap();
        let mut right = LayeredStream::new(b).enable_compression(1).unwrap();
        left.write_all(b"ping").await.unwrap();
        left.flush().await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(left.tls_info().is_none());
    }
}
