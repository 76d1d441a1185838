//! # Client Handshake
//!
//! Drives the handshake after negotiation:
//!
//! ```text
//! ClientInit      -> ClientInitAck | ClientInitReject
//! CoreSetupData   -> CoreSetupAck  | CoreSetupReject    (unconfigured cores)
//! ClientLogin     -> ClientLoginAck | ClientLoginReject
//!                 <- SessionInit
//! ```
//!
//! Each request registers for its replies on a [`KeyedQueue`] before it is
//! sent. The read task resumes the queue under the reply's message type.
//! `SessionInit` is kept until collected since it may arrive before anyone
//! asks for it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace};

use crate::core::features::FeatureSet;
use crate::core::models::{BufferInfo, NetworkId};
use crate::core::variant::{QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::HandshakeMessage;
use crate::service::channel::{ConnectionHandler, FrameSink};
use crate::utils::timeout::with_timeout_error;
use crate::utils::KeyedQueue;

/// What the core reported about itself in `ClientInitAck`.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreState {
    Configured,
    /// The core needs `configure_core` before anyone can log in.
    Unconfigured {
        backend_info: QVariantList,
        authenticator_info: QVariantList,
    },
}

/// Initial session contents delivered by `SessionInit`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub identities: QVariantList,
    pub buffer_infos: Vec<BufferInfo>,
    pub network_ids: Vec<NetworkId>,
}

#[derive(Debug, Clone)]
enum SessionSlot {
    Pending,
    Ready(SessionState),
    Closed,
}

pub struct ClientHandshakeHandler {
    sink: FrameSink,
    queue: KeyedQueue<&'static str, HandshakeMessage>,
    session: watch::Sender<SessionSlot>,
    core_features: Mutex<Option<FeatureSet>>,
    timeout: Duration,
}

fn reject_text(error: Option<String>) -> String {
    error.unwrap_or_else(|| constants::ERR_UNKNOWN.to_owned())
}

impl ClientHandshakeHandler {
    pub fn new(sink: FrameSink, timeout: Duration) -> Self {
        let (session, _) = watch::channel(SessionSlot::Pending);
        Self {
            sink,
            queue: KeyedQueue::new(),
            session,
            core_features: Mutex::new(None),
            timeout,
        }
    }

    async fn request(
        &self,
        message: HandshakeMessage,
        replies: [&'static str; 2],
    ) -> Result<HandshakeMessage> {
        with_timeout_error(
            self.queue
                .wait(replies, || self.sink.emit_handshake(&message)),
            self.timeout,
        )
        .await
    }

    /// Announce the client and learn whether the core is configured.
    ///
    /// Fixes the connection's feature set to what both sides support.
    #[instrument(skip(self, features))]
    pub async fn init(
        &self,
        client_version: &str,
        build_date: &str,
        features: FeatureSet,
    ) -> Result<CoreState> {
        let reply = self
            .request(
                HandshakeMessage::ClientInit {
                    client_version: client_version.to_owned(),
                    build_date: build_date.to_owned(),
                    features: features.clone(),
                },
                ["ClientInitAck", "ClientInitReject"],
            )
            .await?;

        match reply {
            HandshakeMessage::ClientInitReject { error } => {
                Err(ProtocolError::InitError(reject_text(error)))
            }
            HandshakeMessage::ClientInitAck {
                core_features,
                backend_info,
                authenticator_info,
                core_configured,
            } => {
                let negotiated = features.intersect(&core_features);
                debug!(features = ?negotiated.feature_list(), "Negotiated features");
                self.sink.context().set_features(negotiated);
                if let Ok(mut slot) = self.core_features.lock() {
                    *slot = Some(core_features);
                }
                match core_configured {
                    Some(true) => Ok(CoreState::Configured),
                    Some(false) => Ok(CoreState::Unconfigured {
                        backend_info,
                        authenticator_info,
                    }),
                    None => Err(ProtocolError::InitError(constants::ERR_UNKNOWN.into())),
                }
            }
            other => Err(ProtocolError::UnexpectedMessage(other.msg_type().into())),
        }
    }

    /// Set up an unconfigured core.
    #[instrument(skip_all, fields(backend = %backend, authenticator = %authenticator))]
    pub async fn configure_core(
        &self,
        admin_user: &str,
        admin_password: &str,
        backend: &str,
        backend_config: QVariantMap,
        authenticator: &str,
        auth_config: QVariantMap,
    ) -> Result<()> {
        let reply = self
            .request(
                HandshakeMessage::CoreSetupData {
                    admin_user: admin_user.to_owned(),
                    admin_password: admin_password.to_owned(),
                    backend: backend.to_owned(),
                    setup_data: backend_config,
                    authenticator: authenticator.to_owned(),
                    auth_setup_data: auth_config,
                },
                ["CoreSetupAck", "CoreSetupReject"],
            )
            .await?;

        match reply {
            HandshakeMessage::CoreSetupAck => {
                info!("Core configured");
                Ok(())
            }
            HandshakeMessage::CoreSetupReject { error } => {
                Err(ProtocolError::SetupError(reject_text(error)))
            }
            other => Err(ProtocolError::UnexpectedMessage(other.msg_type().into())),
        }
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        let reply = self
            .request(
                HandshakeMessage::ClientLogin {
                    user: user.to_owned(),
                    password: password.to_owned(),
                },
                ["ClientLoginAck", "ClientLoginReject"],
            )
            .await?;

        match reply {
            HandshakeMessage::ClientLoginAck => {
                info!("Logged in");
                Ok(())
            }
            HandshakeMessage::ClientLoginReject { error } => {
                Err(ProtocolError::LoginError(reject_text(error)))
            }
            other => Err(ProtocolError::UnexpectedMessage(other.msg_type().into())),
        }
    }

    /// Wait for the `SessionInit` that follows a successful login.
    ///
    /// Each `SessionInit` is handed out once. Later calls wait for the next
    /// one.
    pub async fn session_init(&self) -> Result<SessionState> {
        with_timeout_error(self.take_session(), self.timeout).await
    }

    async fn take_session(&self) -> Result<SessionState> {
        let mut receiver = self.session.subscribe();
        loop {
            receiver
                .wait_for(|slot| !matches!(slot, SessionSlot::Pending))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            let mut outcome = None;
            self.session.send_if_modified(|slot| {
                match std::mem::replace(slot, SessionSlot::Pending) {
                    SessionSlot::Ready(state) => {
                        outcome = Some(Ok(state));
                        true
                    }
                    SessionSlot::Closed => {
                        *slot = SessionSlot::Closed;
                        outcome = Some(Err(ProtocolError::ConnectionClosed));
                        false
                    }
                    // Another caller collected it first.
                    SessionSlot::Pending => false,
                }
            });
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// The core's full feature set, known after a successful `init`.
    pub fn core_features(&self) -> Option<FeatureSet> {
        self.core_features.lock().ok().and_then(|f| f.clone())
    }

    /// Features frames are encoded with.
    pub fn negotiated_features(&self) -> Arc<FeatureSet> {
        self.sink.context().features()
    }
}

impl ConnectionHandler for ClientHandshakeHandler {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn read(&self, frame: Bytes) -> Result<bool> {
        let message = self.sink.context().decode_handshake(frame)?;
        match message {
            HandshakeMessage::SessionInit {
                identities,
                buffer_infos,
                network_ids,
            } => {
                debug!(
                    buffers = buffer_infos.len(),
                    networks = network_ids.len(),
                    "Session initialized"
                );
                self.session.send_replace(SessionSlot::Ready(SessionState {
                    identities,
                    buffer_infos,
                    network_ids,
                }));
                Ok(true)
            }
            HandshakeMessage::ClientInitAck { .. }
            | HandshakeMessage::ClientInitReject { .. }
            | HandshakeMessage::CoreSetupAck
            | HandshakeMessage::CoreSetupReject { .. }
            | HandshakeMessage::ClientLoginAck
            | HandshakeMessage::ClientLoginReject { .. } => {
                let key = message.msg_type();
                self.queue.resume(&key, message);
                Ok(false)
            }
            other => {
                trace!(msg_type = other.msg_type(), "Ignoring handshake message");
                Ok(false)
            }
        }
    }

    fn close(&self) {
        self.queue.close();
        self.session.send_if_modified(|slot| {
            if matches!(slot, SessionSlot::Pending) {
                *slot = SessionSlot::Closed;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::serializer::SerializerRegistry;
    use crate::service::channel::CodecContext;
    use crate::utils::metrics::Metrics;
    use tokio::sync::mpsc;

    fn handler() -> (Arc<ClientHandshakeHandler>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = FrameSink::new(
            tx,
            Arc::new(CodecContext::default()),
            Arc::new(Metrics::new()),
        );
        (
            Arc::new(ClientHandshakeHandler::new(sink, Duration::from_secs(1))),
            rx,
        )
    }

    fn frame(message: &HandshakeMessage) -> Bytes {
        message
            .serialize(&SerializerRegistry::standard(), &FeatureSet::none())
            .unwrap()
    }

    #[tokio::test]
    async fn init_reject_without_text_is_unknown_error() {
        let (handler, mut sent) = handler();
        let core = handler.clone();
        tokio::spawn(async move {
            sent.recv().await.unwrap();
            core.read(frame(&HandshakeMessage::ClientInitReject { error: None }))
                .unwrap();
        });
        let result = handler.init("v1", "today", FeatureSet::all()).await;
        assert!(matches!(result, Err(ProtocolError::InitError(text)) if text == "Unknown Error"));
    }

    #[tokio::test]
    async fn login_reject_carries_core_text() {
        let (handler, mut sent) = handler();
        let core = handler.clone();
        tokio::spawn(async move {
            sent.recv().await.unwrap();
            core.read(frame(&HandshakeMessage::ClientLoginReject {
                error: Some("Invalid password".into()),
            }))
            .unwrap();
        });
        let result = handler.login("alice", "wrong").await;
        assert!(matches!(result, Err(ProtocolError::LoginError(text)) if text == "Invalid password"));
    }

    #[tokio::test]
    async fn session_init_is_kept_until_collected() {
        let (handler, _sent) = handler();
        let done = handler
            .read(frame(&HandshakeMessage::SessionInit {
                identities: vec![],
                buffer_infos: vec![],
                network_ids: vec![NetworkId(3)],
            }))
            .unwrap();
        assert!(done);
        let state = handler.session_init().await.unwrap();
        assert_eq!(state.network_ids, vec![NetworkId(3)]);
    }

    #[tokio::test]
    async fn session_init_is_collected_once() {
        let (handler, _sent) = handler();
        handler
            .read(frame(&HandshakeMessage::SessionInit {
                identities: vec![],
                buffer_infos: vec![],
                network_ids: vec![NetworkId(3)],
            }))
            .unwrap();
        handler.session_init().await.unwrap();

        let again = handler.clone();
        let waiting = tokio::spawn(async move { again.session_init().await });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        handler.close();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn close_fails_pending_steps() {
        let (handler, _sent) = handler();
        let closer = handler.clone();
        let waiting = tokio::spawn(async move { closer.session_init().await });
        tokio::task::yield_now().await;
        handler.close();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            handler.login("a", "b").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let (handler, _sent) = handler();
        let done = handler
            .read(frame(&HandshakeMessage::ClientLogin {
                user: "x".into(),
                password: "y".into(),
            }))
            .unwrap();
        assert!(!done);
    }
}
