//! # Quassel Client
//!
//! Ties the pieces of a client connection together:
//!
//! 1. TCP connect (or any caller-supplied stream)
//! 2. negotiation, stacking TLS and compression as agreed
//! 3. a [`MessageChannel`] with the handshake handler followed by the
//!    signal proxy handler
//! 4. the handshake steps, exposed one by one
//! 5. after `SessionInit`, heartbeats, the backlog manager and the channel
//!    list helper
//!
//! ## Example
//!
//! ```no_run
//! use quassel_protocol::config::QuasselConfig;
//! use quassel_protocol::service::client::QuasselClient;
//! use quassel_protocol::service::handshake::CoreState;
//!
//! # async fn run() -> quassel_protocol::error::Result<()> {
//! let client = QuasselClient::connect(QuasselConfig::default()).await?;
//! if client.init().await? == CoreState::Configured {
//!     client.login("alice", "hunter2").await?;
//!     let session = client.session_init().await?;
//!     println!("{} buffers", session.buffer_infos.len());
//! }
//! client.close();
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

use crate::config::QuasselConfig;
use crate::core::features::FeatureSet;
use crate::core::models::BufferInfo;
use crate::core::variant::QVariantMap;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Invokers;
use crate::protocol::syncable::{ProtocolSide, SyncProxy};
use crate::service::backlog::{BacklogManager, ClientBacklogManager};
use crate::service::channel::{CodecContext, ConnectionHandler, MessageChannel};
use crate::service::handshake::{ClientHandshakeHandler, CoreState, SessionState};
use crate::service::irc_list::{ClientIrcListHelper, IrcListHelper};
use crate::service::magic::{negotiate, Negotiated};
use crate::service::proxy::ProxyMessageHandler;
use crate::service::rpc::{ClientRpcHandler, SessionEvent};
use crate::service::session::ClientSession;
use crate::transport::tls::{TlsClientConfig, TlsInfo};
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::timeout::with_timeout_error;

/// Events buffered per subscriber before the slowest one starts missing some.
const EVENT_CAPACITY: usize = 256;

pub struct QuasselClient {
    config: QuasselConfig,
    channel: MessageChannel,
    handshake: Arc<ClientHandshakeHandler>,
    session: Arc<ClientSession>,
    rpc: Arc<Mutex<ClientRpcHandler>>,
    backlog: Arc<ClientBacklogManager>,
    irc_list: Arc<ClientIrcListHelper>,
    events: broadcast::Sender<SessionEvent>,
    metrics: Arc<Metrics>,
    negotiated: Negotiated,
    tls_info: Option<TlsInfo>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or(address)
}

impl QuasselClient {
    /// Connect to `config.client.address` and negotiate.
    #[instrument(skip_all, fields(address = %config.client.address))]
    pub async fn connect(config: QuasselConfig) -> Result<Self> {
        for problem in config.validate() {
            warn!("{problem}");
        }
        let stream = with_timeout_error(
            async {
                TcpStream::connect(&config.client.address)
                    .await
                    .map_err(ProtocolError::Io)
            },
            config.client.connection_timeout,
        )
        .await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected");
        Self::from_stream(stream, config).await
    }

    /// Negotiate over an already connected stream and start the channel.
    pub async fn from_stream<S>(stream: S, config: QuasselConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tls = if config.transport.offer_tls {
            Some(TlsClientConfig::from_config(
                &config.tls,
                host_of(&config.client.address),
            )?)
        } else {
            None
        };
        let timeout = config.client.handshake_timeout;
        let (stream, negotiated) =
            negotiate(stream, &config.transport, tls.as_ref(), timeout).await?;
        let tls_info = stream.tls_info();

        let metrics = Arc::new(Metrics::new());
        let context = Arc::new(CodecContext::default());
        let (sink, receiver) = MessageChannel::outbound(context, metrics.clone());

        let invokers = Invokers::new();
        invokers.register(ProtocolSide::Client, ClientRpcHandler::invoker())?;
        invokers.register(ProtocolSide::Client, BacklogManager::invoker())?;
        invokers.register(ProtocolSide::Client, IrcListHelper::invoker())?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handshake = Arc::new(ClientHandshakeHandler::new(sink.clone(), timeout));
        let session = ClientSession::new(sink.clone(), invokers, metrics.clone());
        let rpc = Arc::new(Mutex::new(ClientRpcHandler::new(events.clone())));
        session.set_rpc_handler(rpc.clone())?;
        let backlog = Arc::new(ClientBacklogManager::new(timeout));
        let irc_list = Arc::new(ClientIrcListHelper::new(timeout));
        let proxy = Arc::new(ProxyMessageHandler::new(
            session.clone(),
            backlog.clone(),
            irc_list.clone(),
            events.clone(),
        ));

        let handlers: Vec<Arc<dyn ConnectionHandler>> = vec![handshake.clone(), proxy];
        let channel = MessageChannel::spawn_with_sink(
            stream,
            sink,
            receiver,
            handlers,
            metrics.clone(),
            config.transport.max_frame_size,
        );

        Ok(Self {
            config,
            channel,
            handshake,
            session,
            rpc,
            backlog,
            irc_list,
            events,
            metrics,
            negotiated,
            tls_info,
            heartbeat_task: Mutex::new(None),
        })
    }

    /// `ClientInit` with the configured version and every known feature.
    pub async fn init(&self) -> Result<CoreState> {
        self.init_with_features(FeatureSet::all()).await
    }

    pub async fn init_with_features(&self, features: FeatureSet) -> Result<CoreState> {
        self.handshake
            .init(
                &self.config.client.client_version,
                &self.config.client.client_date,
                features,
            )
            .await
    }

    pub async fn configure_core(
        &self,
        admin_user: &str,
        admin_password: &str,
        backend: &str,
        backend_config: QVariantMap,
        authenticator: &str,
        auth_config: QVariantMap,
    ) -> Result<()> {
        self.handshake
            .configure_core(
                admin_user,
                admin_password,
                backend,
                backend_config,
                authenticator,
                auth_config,
            )
            .await
    }

    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        self.handshake.login(user, password).await
    }

    /// Wait for `SessionInit`, then start heartbeats and synchronize the
    /// backlog manager and channel list helper.
    pub async fn session_init(&self) -> Result<SessionState> {
        let state = self.handshake.session_init().await?;
        info!(
            networks = state.network_ids.len(),
            buffers = state.buffer_infos.len(),
            identities = state.identities.len(),
            "Session started"
        );
        self.session.synchronize(self.backlog.handle())?;
        self.session.synchronize(self.irc_list.handle())?;
        self.start_heartbeat();
        Ok(state)
    }

    fn start_heartbeat(&self) {
        let interval = self.config.client.heartbeat_interval;
        let session = Arc::downgrade(&self.session);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = session.upgrade() else {
                    break;
                };
                if let Err(e) = live.send_heartbeat() {
                    debug!(error = %e, "Heartbeat stopped");
                    break;
                }
            }
        });
        if let Ok(mut slot) = self.heartbeat_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Type a line into a buffer.
    pub fn send_input(&self, buffer_info: BufferInfo, input: &str) -> Result<()> {
        self.rpc
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?
            .send_input(buffer_info, input)
    }

    pub fn backlog(&self) -> &ClientBacklogManager {
        &self.backlog
    }

    pub fn irc_list(&self) -> &ClientIrcListHelper {
        &self.irc_list
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Events from now on. A subscriber that falls behind sees a lag error
    /// item and then continues.
    pub fn events(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls_info.as_ref()
    }

    /// Features the connection encodes with, fixed by `init`.
    pub fn features(&self) -> Arc<FeatureSet> {
        self.handshake.negotiated_features()
    }

    pub fn core_features(&self) -> Option<FeatureSet> {
        self.handshake.core_features()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.session.heartbeat().latency()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Resolve once the core has gone away.
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    /// Drop the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        if let Ok(mut slot) = self.heartbeat_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        self.channel.close();
        self.metrics.log_metrics();
    }
}

impl Drop for QuasselClient {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.heartbeat_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for QuasselClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuasselClient")
            .field("address", &self.config.client.address)
            .field("negotiated", &self.negotiated)
            .field("closed", &self.is_closed())
            .finish()
    }
}
