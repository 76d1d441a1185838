//! Client sessions over negotiated stream layers, and cores that misbehave
//! at the framing level.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;

use quassel_protocol::config::QuasselConfig;
use quassel_protocol::core::codec::FrameCodec;
use quassel_protocol::core::features::FeatureSet;
use quassel_protocol::core::serializer::SerializerRegistry;
use quassel_protocol::error::ProtocolError;
use quassel_protocol::protocol::handshake::HandshakeMessage;
use quassel_protocol::protocol::negotiation::ProtocolFeatures;
use quassel_protocol::service::handshake::CoreState;
use quassel_protocol::service::magic::accept;
use quassel_protocol::transport::compression::DeflateStream;
use quassel_protocol::QuasselClient;

const STEP: Duration = Duration::from_secs(5);

fn config(compression: bool) -> QuasselConfig {
    QuasselConfig::default_with_overrides(|config| {
        config.transport.offer_tls = false;
        config.transport.offer_compression = compression;
        config.transport.max_frame_size = 64 * 1024;
        config.client.handshake_timeout = STEP;
    })
}

async fn answer_init<S>(framed: &mut Framed<S, FrameCodec>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let registry = SerializerRegistry::standard();
    let frame = tokio::time::timeout(STEP, framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match HandshakeMessage::deserialize(frame, &registry, &FeatureSet::none()).unwrap() {
        HandshakeMessage::ClientInit { client_version, .. } => {
            assert!(!client_version.is_empty());
        }
        other => panic!("expected ClientInit, got {other:?}"),
    }
    let ack = HandshakeMessage::ClientInitAck {
        core_features: FeatureSet::all(),
        backend_info: vec![],
        authenticator_info: vec![],
        core_configured: Some(true),
    };
    framed
        .send(ack.serialize(&registry, &FeatureSet::none()).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn compressed_session_handshakes() {
    let (client_end, mut core_end) = tokio::io::duplex(16 * 1024);
    let core = tokio::spawn(async move {
        let header = accept(&mut core_end, ProtocolFeatures::COMPRESSION).await.unwrap();
        assert!(header.features.contains(ProtocolFeatures::COMPRESSION));
        let mut framed = Framed::new(DeflateStream::new(core_end, 6), FrameCodec::default());
        answer_init(&mut framed).await;
        framed
    });

    let client = QuasselClient::from_stream(client_end, config(true))
        .await
        .unwrap();
    assert!(client
        .negotiated()
        .features
        .contains(ProtocolFeatures::COMPRESSION));
    assert!(client.tls_info().is_none());

    assert_eq!(client.init().await.unwrap(), CoreState::Configured);
    assert_eq!(*client.features(), FeatureSet::all());

    let framed = core.await.unwrap();
    let (sent, received) = framed.get_ref().totals();
    assert!(sent > 0);
    assert!(received > 0);
    client.close();
}

#[tokio::test]
async fn compression_declined_by_core_stays_plain() {
    let (client_end, mut core_end) = tokio::io::duplex(16 * 1024);
    let core = tokio::spawn(async move {
        accept(&mut core_end, ProtocolFeatures::empty()).await.unwrap();
        let mut framed = Framed::new(core_end, FrameCodec::default());
        answer_init(&mut framed).await;
        framed
    });

    let client = QuasselClient::from_stream(client_end, config(true))
        .await
        .unwrap();
    assert_eq!(client.negotiated().features, ProtocolFeatures::empty());
    assert_eq!(client.init().await.unwrap(), CoreState::Configured);
    core.await.unwrap();
}

#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let (client_end, mut core_end) = tokio::io::duplex(16 * 1024);
    let core = tokio::spawn(async move {
        accept(&mut core_end, ProtocolFeatures::empty()).await.unwrap();
        // Length prefix well past the client's limit, no payload.
        core_end.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();
        core_end.flush().await.unwrap();
        core_end
    });

    let client = QuasselClient::from_stream(client_end, config(false))
        .await
        .unwrap();
    let _core_end = core.await.unwrap();

    tokio::time::timeout(STEP, client.closed()).await.unwrap();
    assert!(client.is_closed());
    let result = client.init().await;
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
}

#[tokio::test]
async fn malformed_handshake_frame_closes_the_connection() {
    let (client_end, mut core_end) = tokio::io::duplex(16 * 1024);
    let core = tokio::spawn(async move {
        accept(&mut core_end, ProtocolFeatures::empty()).await.unwrap();
        let mut framed = Framed::new(core_end, FrameCodec::default());
        // A QVariantList claiming three items, then nothing.
        let mut payload = BytesMut::new();
        payload.put_i32(3);
        framed.send(payload.freeze()).await.unwrap();
        framed
    });

    let client = QuasselClient::from_stream(client_end, config(false))
        .await
        .unwrap();
    let pending = client.init();
    let result = tokio::time::timeout(STEP, pending).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert!(client.is_closed());
    core.await.unwrap();
}

#[tokio::test]
async fn frames_keep_their_order_across_the_wire() {
    let (client_end, mut core_end) = tokio::io::duplex(1024);
    let core = tokio::spawn(async move {
        accept(&mut core_end, ProtocolFeatures::COMPRESSION).await.unwrap();
        let mut framed = Framed::new(DeflateStream::new(core_end, 1), FrameCodec::default());
        answer_init(&mut framed).await;
        let registry = SerializerRegistry::standard();
        let mut logins = Vec::new();
        for _ in 0..2 {
            let frame: Bytes = framed.next().await.unwrap().unwrap();
            match HandshakeMessage::deserialize(frame, &registry, &FeatureSet::all()).unwrap() {
                HandshakeMessage::ClientLogin { user, .. } => logins.push(user),
                other => panic!("expected ClientLogin, got {other:?}"),
            }
            let ack = HandshakeMessage::ClientLoginReject {
                error: Some("try again".into()),
            };
            framed
                .send(ack.serialize(&registry, &FeatureSet::all()).unwrap())
                .await
                .unwrap();
        }
        logins
    });

    let client = QuasselClient::from_stream(client_end, config(true))
        .await
        .unwrap();
    client.init().await.unwrap();
    for user in ["alice", "bob"] {
        let result = client.login(user, "wrong").await;
        assert!(matches!(result, Err(ProtocolError::LoginError(text)) if text == "try again"));
    }
    assert_eq!(core.await.unwrap(), vec!["alice".to_string(), "bob".to_string()]);
}
