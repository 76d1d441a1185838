//! Client side of connection negotiation.
//!
//! Runs on the raw stream before any framing: send the magic header, read
//! the core's 4-byte answer, then stack TLS and compression as agreed.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::config::TransportConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::negotiation::{
    ClientHeader, CoreHeader, ProtocolFeatures, ProtocolMeta, ProtocolVersion,
};
use crate::transport::tls::TlsClientConfig;
use crate::transport::LayeredStream;
use crate::utils::timeout::with_timeout_error;

/// Outcome of negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub features: ProtocolFeatures,
    pub meta: ProtocolMeta,
}

/// Features the client will offer given its transport settings.
pub fn offered_features(transport: &TransportConfig, tls_available: bool) -> ProtocolFeatures {
    let mut features = ProtocolFeatures::empty();
    if transport.offer_tls && tls_available {
        features = features | ProtocolFeatures::TLS;
    }
    if transport.offer_compression {
        features = features | ProtocolFeatures::COMPRESSION;
    }
    features
}

/// Negotiate over `stream` and return it with the agreed layers applied.
///
/// `tls` is required only if TLS is offered. Only the datastream protocol
/// is offered.
#[instrument(skip_all)]
pub async fn negotiate<S>(
    mut stream: S,
    transport: &TransportConfig,
    tls: Option<&TlsClientConfig>,
    timeout: Duration,
) -> Result<(LayeredStream<S>, Negotiated)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = ClientHeader {
        features: offered_features(transport, tls.is_some()),
        protocols: vec![ProtocolMeta::datastream()],
    };
    let mut buf = BytesMut::with_capacity(8);
    header.encode(&mut buf);
    debug!(features = header.features.bits(), "Sending client header");

    let reply = with_timeout_error(
        async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            let mut raw = [0u8; CoreHeader::LEN];
            stream.read_exact(&mut raw).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ProtocolError::ConnectionClosed
                } else {
                    ProtocolError::Io(e)
                }
            })?;
            CoreHeader::decode(raw)
        },
        timeout,
    )
    .await?;

    if reply.meta.version != ProtocolVersion::Datastream {
        return Err(ProtocolError::UnsupportedVersion(reply.meta.version as u8));
    }

    let mut layered = LayeredStream::new(stream);
    if reply.features.contains(ProtocolFeatures::TLS) {
        let tls = tls.ok_or_else(|| {
            ProtocolError::TransportError("Core enabled TLS that was never offered".into())
        })?;
        layered = with_timeout_error(layered.enable_tls(tls), timeout).await?;
    }
    if reply.features.contains(ProtocolFeatures::COMPRESSION) {
        if !header.features.contains(ProtocolFeatures::COMPRESSION) {
            return Err(ProtocolError::TransportError(
                "Core enabled compression that was never offered".into(),
            ));
        }
        layered = layered.enable_compression(transport.compression_level)?;
    }

    info!(
        version = %reply.meta.version,
        tls = layered.is_tls(),
        compression = layered.is_compressed(),
        "Negotiation complete"
    );
    Ok((
        layered,
        Negotiated {
            features: reply.features,
            meta: reply.meta,
        },
    ))
}

/// Core side of negotiation, answering with `features & offered`.
///
/// Used to stand in for a core in tests and tools. The returned stream has
/// no layers applied; callers add them as the reply dictates.
pub async fn accept<S>(stream: &mut S, features: ProtocolFeatures) -> Result<ClientHeader>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; 4];
    stream.read_exact(&mut first).await?;
    let mut raw = BytesMut::from(&first[..]);
    // Read protocol entries up to and including the marked last one.
    loop {
        let mut entry = [0u8; 4];
        stream.read_exact(&mut entry).await?;
        raw.extend_from_slice(&entry);
        if entry[0] & 0x80 != 0 {
            break;
        }
    }
    let header = ClientHeader::decode(&mut Bytes::from(raw))?;
    let meta = header
        .protocols
        .iter()
        .copied()
        .find(|meta| meta.version == ProtocolVersion::Datastream)
        .ok_or(ProtocolError::UnsupportedVersion(ProtocolVersion::Legacy as u8))?;
    let reply = CoreHeader {
        features: ProtocolFeatures::from_bits_truncate(features.bits() & header.features.bits()),
        meta,
    };
    let mut out = BytesMut::with_capacity(CoreHeader::LEN);
    reply.encode(&mut out);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(header)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn transport(tls: bool, compression: bool) -> TransportConfig {
        TransportConfig {
            offer_tls: tls,
            offer_compression: compression,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn tls_is_offered_only_with_a_config() {
        let t = transport(true, true);
        assert_eq!(offered_features(&t, false), ProtocolFeatures::COMPRESSION);
        assert_eq!(offered_features(&t, true), ProtocolFeatures::all());
        assert_eq!(
            offered_features(&transport(false, false), true),
            ProtocolFeatures::empty()
        );
    }

    #[tokio::test]
    async fn plain_negotiation() {
        let (client, mut core) = tokio::io::duplex(1024);
        let core_task =
            tokio::spawn(async move { accept(&mut core, ProtocolFeatures::empty()).await.unwrap() });
        let (stream, negotiated) = negotiate(
            client,
            &transport(false, true),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let header = core_task.await.unwrap();
        assert!(header.features.contains(ProtocolFeatures::COMPRESSION));
        assert!(!stream.is_compressed());
        assert_eq!(negotiated.meta.version, ProtocolVersion::Datastream);
    }

    #[tokio::test]
    async fn compression_is_applied_when_agreed() {
        let (client, mut core) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            accept(&mut core, ProtocolFeatures::COMPRESSION).await.unwrap();
            core
        });
        let (stream, negotiated) = negotiate(
            client,
            &transport(false, true),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(stream.is_compressed());
        assert!(negotiated.features.contains(ProtocolFeatures::COMPRESSION));
    }

    #[tokio::test]
    async fn legacy_only_core_is_rejected() {
        let (client, mut core) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut header = [0u8; 8];
            core.read_exact(&mut header).await.unwrap();
            core.write_all(&[0x00, 0x00, 0x00, 0x01]).await.unwrap();
            core
        });
        let result = negotiate(client, &transport(false, false), None, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(1))));
    }

    #[tokio::test]
    async fn silent_core_times_out() {
        let (client, _core) = tokio::io::duplex(1024);
        let result =
            negotiate(client, &transport(false, false), None, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn closed_core_is_reported() {
        let (client, core) = tokio::io::duplex(1024);
        drop(core);
        let result = negotiate(client, &transport(false, false), None, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
