//! End-to-end client sessions against a scripted core over an in-memory pipe.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use quassel_protocol::config::QuasselConfig;
use quassel_protocol::core::codec::FrameCodec;
use quassel_protocol::core::features::FeatureSet;
use quassel_protocol::core::models::{
    BufferId, BufferInfo, BufferType, Message, MessageFlag, MessageType, MsgId, NetworkId,
};
use quassel_protocol::core::serializer::SerializerRegistry;
use quassel_protocol::core::variant::{QDateTime, QVariant, QVariantMap};
use quassel_protocol::error::ProtocolError;
use quassel_protocol::protocol::handshake::HandshakeMessage;
use quassel_protocol::protocol::negotiation::ProtocolFeatures;
use quassel_protocol::protocol::signal_proxy::SignalProxyMessage;
use quassel_protocol::service::backlog::UNBOUNDED;
use quassel_protocol::service::handshake::CoreState;
use quassel_protocol::service::magic::accept;
use quassel_protocol::{QuasselClient, SessionEvent};

const STEP: Duration = Duration::from_secs(5);

/// Scripted core end of the connection.
struct Core {
    framed: Framed<DuplexStream, FrameCodec>,
    registry: SerializerRegistry,
    features: FeatureSet,
}

impl Core {
    async fn accept(mut stream: DuplexStream) -> Self {
        accept(&mut stream, ProtocolFeatures::empty()).await.unwrap();
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
            registry: SerializerRegistry::standard(),
            features: FeatureSet::none(),
        }
    }

    async fn recv(&mut self) -> Bytes {
        tokio::time::timeout(STEP, self.framed.next())
            .await
            .expect("client went quiet")
            .expect("client hung up")
            .unwrap()
    }

    async fn recv_handshake(&mut self) -> HandshakeMessage {
        let frame = self.recv().await;
        HandshakeMessage::deserialize(frame, &self.registry, &self.features).unwrap()
    }

    async fn send_handshake(&mut self, message: HandshakeMessage) {
        let frame = message.serialize(&self.registry, &self.features).unwrap();
        self.framed.send(frame).await.unwrap();
    }

    async fn recv_proxy(&mut self) -> SignalProxyMessage {
        let frame = self.recv().await;
        SignalProxyMessage::deserialize(frame, &self.registry, &self.features).unwrap()
    }

    async fn send_proxy(&mut self, message: SignalProxyMessage) {
        let frame = message.serialize(&self.registry, &self.features).unwrap();
        self.framed.send(frame).await.unwrap();
    }

    /// Answer ClientInit with an ack for a configured core.
    async fn ack_init(&mut self, configured: Option<bool>) {
        match self.recv_handshake().await {
            HandshakeMessage::ClientInit { features, .. } => {
                self.features = features.intersect(&FeatureSet::all());
            }
            other => panic!("expected ClientInit, got {other:?}"),
        }
        self.send_handshake(HandshakeMessage::ClientInitAck {
            core_features: FeatureSet::all(),
            backend_info: vec![],
            authenticator_info: vec![],
            core_configured: configured,
        })
        .await;
    }
}

fn config() -> QuasselConfig {
    QuasselConfig::default_with_overrides(|config| {
        config.transport.offer_tls = false;
        config.transport.offer_compression = false;
        config.client.handshake_timeout = STEP;
    })
}

fn buffer() -> BufferInfo {
    BufferInfo {
        buffer_id: BufferId(1),
        network_id: NetworkId(1),
        buffer_type: BufferType::CHANNEL,
        group_id: 0,
        buffer_name: Some("#quassel".into()),
    }
}

fn message(id: i64, content: &str) -> Message {
    Message {
        message_id: MsgId(id),
        time: DateTime::from_timestamp(1_600_000_000 + id, 0).unwrap(),
        message_type: MessageType::PLAIN,
        flag: MessageFlag::empty(),
        buffer_info: buffer(),
        sender: "justJanne!~jj@example.org".into(),
        sender_prefixes: "@".into(),
        real_name: "Janne".into(),
        avatar_url: String::new(),
        content: content.into(),
    }
}

async fn start(core_script: impl FnOnce(Core) -> tokio::task::JoinHandle<()>) -> (QuasselClient, tokio::task::JoinHandle<()>) {
    let (client_end, core_end) = tokio::io::duplex(64 * 1024);
    let core = tokio::spawn(async move { Core::accept(core_end).await });
    let client = QuasselClient::from_stream(client_end, config()).await.unwrap();
    let core = core.await.unwrap();
    (client, core_script(core))
}

#[tokio::test]
async fn full_session() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            core.ack_init(Some(true)).await;

            match core.recv_handshake().await {
                HandshakeMessage::ClientLogin { user, password } => {
                    assert_eq!(user, "alice");
                    assert_eq!(password, "secret");
                }
                other => panic!("expected ClientLogin, got {other:?}"),
            }
            core.send_handshake(HandshakeMessage::ClientLoginAck).await;
            core.send_handshake(HandshakeMessage::SessionInit {
                identities: vec![],
                buffer_infos: vec![buffer()],
                network_ids: vec![NetworkId(1)],
            })
            .await;

            assert_eq!(
                core.recv_proxy().await,
                SignalProxyMessage::InitRequest {
                    class_name: "BacklogManager".into(),
                    object_name: String::new(),
                }
            );
            core.send_proxy(SignalProxyMessage::InitData {
                class_name: "BacklogManager".into(),
                object_name: String::new(),
                init_data: QVariantMap::new(),
            })
            .await;

            // Unknown to the client; dropped without ending the session.
            core.send_proxy(SignalProxyMessage::Sync {
                class_name: "Network".into(),
                object_name: "1".into(),
                slot_name: "setNetworkName".into(),
                params: vec![QVariant::from("Libera")],
            })
            .await;
            core.send_proxy(SignalProxyMessage::Rpc {
                slot_name: "2displayMsg(Message)".into(),
                params: vec![QVariant::from(message(7, "hello"))],
            })
            .await;

            match core.recv_proxy().await {
                SignalProxyMessage::Sync {
                    class_name,
                    slot_name,
                    params,
                    ..
                } => {
                    assert_eq!(class_name, "BacklogManager");
                    assert_eq!(slot_name, "requestBacklog");
                    let mut reply = params;
                    reply.push(QVariant::QVariantList(vec![
                        QVariant::from(message(1, "one")),
                        QVariant::from(message(2, "two")),
                    ]));
                    core.send_proxy(SignalProxyMessage::Sync {
                        class_name: "BacklogManager".into(),
                        object_name: String::new(),
                        slot_name: "receiveBacklog".into(),
                        params: reply,
                    })
                    .await;
                }
                other => panic!("expected backlog request, got {other:?}"),
            }

            let stamp = QDateTime::now();
            core.send_proxy(SignalProxyMessage::HeartBeat(stamp)).await;
            assert_eq!(
                core.recv_proxy().await,
                SignalProxyMessage::HeartBeatReply(stamp)
            );
        })
    })
    .await;

    let mut events = client.subscribe();

    assert_eq!(client.init().await.unwrap(), CoreState::Configured);
    assert_eq!(*client.features(), FeatureSet::all());
    client.login("alice", "secret").await.unwrap();
    let session = client.session_init().await.unwrap();
    assert_eq!(session.network_ids, vec![NetworkId(1)]);
    assert_eq!(session.buffer_infos, vec![buffer()]);

    tokio::time::timeout(STEP, client.session().init_tracker().wait_finished())
        .await
        .unwrap();
    assert!(client.backlog().is_initialized());

    let event = tokio::time::timeout(STEP, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, SessionEvent::DisplayMessage(Box::new(message(7, "hello"))));

    let backlog = client
        .backlog()
        .backlog(BufferId(1), UNBOUNDED, UNBOUNDED, 10, 0)
        .await
        .unwrap();
    assert_eq!(backlog, vec![message(1, "one"), message(2, "two")]);

    core.await.unwrap();
    let metrics = client.metrics();
    assert_eq!(metrics.dispatch_errors, 1);
    assert!(metrics.frames_received >= 7);
    client.close();
}

#[tokio::test]
async fn unconfigured_core_without_backends_reports_empty_lists() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            core.ack_init(Some(false)).await;
        })
    })
    .await;

    assert_eq!(
        client.init().await.unwrap(),
        CoreState::Unconfigured {
            backend_info: vec![],
            authenticator_info: vec![],
        }
    );
    core.await.unwrap();
    client.close();
}

#[tokio::test]
async fn unconfigured_core_is_set_up() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            match core.recv_handshake().await {
                HandshakeMessage::ClientInit { .. } => {}
                other => panic!("expected ClientInit, got {other:?}"),
            }
            let mut backend = QVariantMap::new();
            backend.insert("DisplayName".into(), QVariant::from("SQLite"));
            core.send_handshake(HandshakeMessage::ClientInitAck {
                core_features: FeatureSet::none(),
                backend_info: vec![QVariant::QVariantMap(backend)],
                authenticator_info: vec![],
                core_configured: Some(false),
            })
            .await;

            match core.recv_handshake().await {
                HandshakeMessage::CoreSetupData {
                    admin_user,
                    backend,
                    ..
                } => {
                    assert_eq!(admin_user, "admin");
                    assert_eq!(backend, "SQLite");
                }
                other => panic!("expected CoreSetupData, got {other:?}"),
            }
            core.send_handshake(HandshakeMessage::CoreSetupAck).await;
        })
    })
    .await;

    match client.init().await.unwrap() {
        CoreState::Unconfigured { backend_info, .. } => assert_eq!(backend_info.len(), 1),
        CoreState::Configured => panic!("core reported as configured"),
    }
    // Nothing in common with a featureless core.
    assert_eq!(*client.features(), FeatureSet::none());

    client
        .configure_core(
            "admin",
            "admin-password",
            "SQLite",
            QVariantMap::new(),
            "Database",
            QVariantMap::new(),
        )
        .await
        .unwrap();
    core.await.unwrap();
}

/// Log in and answer the backlog manager's init request.
async fn logged_in(core: &mut Core) {
    core.ack_init(Some(true)).await;
    core.recv_handshake().await;
    core.send_handshake(HandshakeMessage::ClientLoginAck).await;
    core.send_handshake(HandshakeMessage::SessionInit {
        identities: vec![],
        buffer_infos: vec![],
        network_ids: vec![NetworkId(1)],
    })
    .await;
    match core.recv_proxy().await {
        SignalProxyMessage::InitRequest { class_name, .. } => {
            assert_eq!(class_name, "BacklogManager")
        }
        other => panic!("expected InitRequest, got {other:?}"),
    }
}

async fn recv_list_request(core: &mut Core) -> Vec<String> {
    match core.recv_proxy().await {
        SignalProxyMessage::Sync {
            class_name,
            slot_name,
            params,
            ..
        } => {
            assert_eq!(class_name, "IrcListHelper");
            assert_eq!(slot_name, "requestChannelList");
            assert_eq!(params[0], QVariant::NetworkId(NetworkId(1)));
            params[1].get().unwrap()
        }
        other => panic!("expected requestChannelList, got {other:?}"),
    }
}

fn list_helper_sync(slot_name: &str, params: Vec<QVariant>) -> SignalProxyMessage {
    SignalProxyMessage::Sync {
        class_name: "IrcListHelper".into(),
        object_name: String::new(),
        slot_name: slot_name.into(),
        params,
    }
}

#[tokio::test]
async fn channel_list_over_the_wire() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            logged_in(&mut core).await;

            assert_eq!(recv_list_request(&mut core).await, vec!["#quassel*".to_string()]);
            core.send_proxy(list_helper_sync(
                "reportFinishedList",
                vec![QVariant::NetworkId(NetworkId(1))],
            ))
            .await;
            assert!(recv_list_request(&mut core).await.is_empty());
            core.send_proxy(list_helper_sync(
                "receiveChannelList",
                vec![
                    QVariant::NetworkId(NetworkId(1)),
                    QVariant::string_list(Vec::<String>::new()),
                    QVariant::QVariantList(vec![QVariant::QVariantList(vec![
                        QVariant::from("#quassel"),
                        QVariant::UInt(42),
                        QVariant::from("Quassel IRC"),
                    ])]),
                ],
            ))
            .await;

            recv_list_request(&mut core).await;
            core.send_proxy(list_helper_sync(
                "reportError",
                vec![QVariant::from("Not connected to network")],
            ))
            .await;
        })
    })
    .await;

    client.init().await.unwrap();
    client.login("alice", "secret").await.unwrap();
    client.session_init().await.unwrap();

    let channels = client
        .irc_list()
        .channel_list(NetworkId(1), vec!["#quassel*".into()])
        .await
        .unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].channel_name, "#quassel");
    assert_eq!(channels[0].user_count, 42);
    assert_eq!(channels[0].topic, "Quassel IRC");

    let result = client.irc_list().channel_list(NetworkId(1), vec![]).await;
    assert!(matches!(
        result,
        Err(ProtocolError::ChannelListError(text)) if text == "Not connected to network"
    ));
    core.await.unwrap();
    client.close();
}

#[tokio::test]
async fn init_reject_surfaces_core_text() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            core.recv_handshake().await;
            core.send_handshake(HandshakeMessage::ClientInitReject {
                error: Some("bad version".into()),
            })
            .await;
        })
    })
    .await;

    let result = client.init().await;
    assert!(matches!(result, Err(ProtocolError::InitError(text)) if text == "bad version"));
    core.await.unwrap();
}

#[tokio::test]
async fn missing_configured_flag_is_an_init_error() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move { core.ack_init(None).await })
    })
    .await;

    let result = client.init().await;
    assert!(matches!(result, Err(ProtocolError::InitError(text)) if text == "Unknown Error"));
    core.await.unwrap();
}

#[tokio::test]
async fn core_hangup_fails_pending_steps() {
    let (client, core) = start(|mut core| {
        tokio::spawn(async move {
            core.ack_init(Some(true)).await;
            core.recv_handshake().await;
            drop(core);
        })
    })
    .await;

    let mut events = client.subscribe();
    client.init().await.unwrap();
    let result = client.login("alice", "secret").await;
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));

    tokio::time::timeout(STEP, client.closed()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(
        tokio::time::timeout(STEP, events.recv()).await.unwrap().unwrap(),
        SessionEvent::Closed
    );
    assert!(matches!(
        client.backlog().backlog(BufferId(1), UNBOUNDED, UNBOUNDED, 1, 0).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    core.await.unwrap();
}
