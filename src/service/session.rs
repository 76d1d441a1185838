//! # Client Session
//!
//! The signal proxy endpoint on the client. Owns the object repository and
//! routes every inbound message:
//!
//! | Message | Action |
//! |---------|--------|
//! | HeartBeat | answer with HeartBeatReply |
//! | HeartBeatReply | update latency |
//! | InitData | initialize the tracked object, drop if unknown |
//! | InitRequest | ignored, the core is the source of truth |
//! | Rpc | invoke on the RPC handler |
//! | Sync | invoke on the tracked object |
//!
//! The repository lock is never held while an object method runs, so
//! methods may call back into the session.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, instrument, trace};

use crate::core::variant::{QDateTime, QVariantList};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Invokers;
use crate::protocol::repository::ObjectRepository;
use crate::protocol::signal_proxy::SignalProxyMessage;
use crate::protocol::syncable::{ProtocolSide, SyncProxy, SyncableHandle};
use crate::service::channel::FrameSink;
use crate::utils::heartbeat::HeartBeatHandler;
use crate::utils::init_tracker::InitTracker;
use crate::utils::metrics::Metrics;

/// Class name every RPC is routed to.
pub const RPC_HANDLER_CLASS: &str = "RpcHandler";

pub struct ClientSession {
    sink: FrameSink,
    invokers: Invokers,
    repository: Mutex<ObjectRepository>,
    rpc_handler: Mutex<Option<SyncableHandle>>,
    heartbeat: HeartBeatHandler,
    init_tracker: InitTracker,
    metrics: Arc<Metrics>,
    self_ref: Weak<ClientSession>,
}

impl ClientSession {
    pub fn new(sink: FrameSink, invokers: Invokers, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            sink,
            invokers,
            repository: Mutex::new(ObjectRepository::new()),
            rpc_handler: Mutex::new(None),
            heartbeat: HeartBeatHandler::new(),
            init_tracker: InitTracker::new(),
            metrics,
            self_ref: self_ref.clone(),
        })
    }

    fn repository(&self) -> Result<MutexGuard<'_, ObjectRepository>> {
        self.repository
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_REPOSITORY_LOCK.into()))
    }

    fn proxy_ref(&self) -> Weak<dyn SyncProxy> {
        let weak: Weak<dyn SyncProxy> = self.self_ref.clone();
        weak
    }

    /// Install the object RPCs are dispatched to.
    pub fn set_rpc_handler(&self, handle: SyncableHandle) -> Result<()> {
        {
            let mut object = handle
                .lock()
                .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
            object.state_mut().attach(self.proxy_ref());
        }
        let mut slot = self
            .rpc_handler
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
        *slot = Some(handle);
        Ok(())
    }

    pub fn find(&self, class_name: &str, object_name: &str) -> Result<Option<SyncableHandle>> {
        Ok(self.repository()?.find(class_name, object_name))
    }

    pub fn object_count(&self) -> usize {
        self.repository().map(|r| r.len()).unwrap_or_default()
    }

    pub fn heartbeat(&self) -> &HeartBeatHandler {
        &self.heartbeat
    }

    pub fn init_tracker(&self) -> &InitTracker {
        &self.init_tracker
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn emit(&self, message: &SignalProxyMessage) -> Result<()> {
        self.sink.emit_signal_proxy(message)
    }

    /// Send a heartbeat stamped with the current time.
    pub fn send_heartbeat(&self) -> Result<()> {
        self.emit(&SignalProxyMessage::HeartBeat(QDateTime::now()))?;
        self.metrics.heartbeat_sent();
        Ok(())
    }

    /// Route one inbound message.
    #[instrument(skip_all, fields(kind = message.message_type()))]
    pub fn dispatch(&self, message: SignalProxyMessage) -> Result<()> {
        match message {
            SignalProxyMessage::HeartBeat(timestamp) => {
                self.heartbeat.received();
                self.emit(&SignalProxyMessage::HeartBeatReply(timestamp))
            }
            SignalProxyMessage::HeartBeatReply(timestamp) => {
                self.heartbeat.recompute_latency(&timestamp);
                self.metrics.heartbeat_reply();
                Ok(())
            }
            SignalProxyMessage::InitData {
                class_name,
                object_name,
                init_data,
            } => {
                let found = self.repository()?.find(&class_name, &object_name);
                match found {
                    Some(handle) => {
                        ObjectRepository::init(&handle, &init_data)?;
                        self.init_tracker.received(&class_name, &object_name);
                        debug!(class = %class_name, object = %object_name, "Object initialized");
                    }
                    // Already torn down locally.
                    None => {
                        trace!(class = %class_name, object = %object_name, "InitData for unknown object")
                    }
                }
                Ok(())
            }
            SignalProxyMessage::InitRequest {
                class_name,
                object_name,
            } => {
                trace!(class = %class_name, object = %object_name, "Ignoring InitRequest");
                Ok(())
            }
            SignalProxyMessage::Rpc { slot_name, params } => {
                let invoker = self.invokers.get(ProtocolSide::Client, RPC_HANDLER_CLASS)?;
                let handle = self
                    .rpc_handler
                    .lock()
                    .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?
                    .clone()
                    .ok_or_else(|| ProtocolError::InvokerNotFound(RPC_HANDLER_CLASS.into()))?;
                let mut object = handle
                    .lock()
                    .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
                trace!(slot = %slot_name, "Dispatching rpc");
                invoker.invoke(&mut *object, &slot_name, &params)?;
                self.metrics.rpc_dispatched();
                Ok(())
            }
            SignalProxyMessage::Sync {
                class_name,
                object_name,
                slot_name,
                params,
            } => {
                let invoker = self.invokers.get(ProtocolSide::Client, &class_name)?;
                let handle = self
                    .repository()?
                    .find(&class_name, &object_name)
                    .ok_or_else(|| ProtocolError::SyncableNotFound {
                        class_name: class_name.clone(),
                        object_name: object_name.clone(),
                    })?;
                let mut object = handle
                    .lock()
                    .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
                trace!(class = %class_name, object = %object_name, slot = %slot_name, "Dispatching sync");
                invoker.invoke(&mut *object, &slot_name, &params)?;
                self.metrics.sync_dispatched();
                Ok(())
            }
        }
    }

    /// Stop tracking everything. Objects keep their state but no longer
    /// reach the session.
    pub fn clear(&self) {
        if let Ok(mut repository) = self.repository() {
            repository.clear();
        }
    }
}

impl SyncProxy for ClientSession {
    fn protocol_side(&self) -> ProtocolSide {
        ProtocolSide::Client
    }

    fn synchronize(&self, handle: SyncableHandle) -> Result<()> {
        let (class_name, object_name, initialized) = {
            let mut object = handle
                .lock()
                .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
            object.state_mut().attach(self.proxy_ref());
            let state = object.state();
            (
                state.class_name().to_owned(),
                state.object_name().to_owned(),
                state.initialized(),
            )
        };

        let added = self.repository()?.add(&class_name, &object_name, &handle);
        if added && !initialized {
            self.init_tracker.requested(&class_name, &object_name);
            self.emit(&SignalProxyMessage::InitRequest {
                class_name,
                object_name,
            })?;
        }
        Ok(())
    }

    fn stop_synchronize(&self, handle: &SyncableHandle) -> Result<()> {
        let (class_name, object_name) = {
            let mut object = handle
                .lock()
                .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
            object.state_mut().set_initialized(false);
            let state = object.state();
            (state.class_name().to_owned(), state.object_name().to_owned())
        };
        self.repository()?.remove(&class_name, &object_name);
        // Nothing is coming for it anymore.
        self.init_tracker.received(&class_name, &object_name);
        Ok(())
    }

    fn rename(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()> {
        let renamed = self.repository()?.rename(class_name, old_name, new_name);
        if let Some(handle) = renamed {
            let mut object = handle
                .lock()
                .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
            object.state_mut().set_object_name(new_name);
        }
        Ok(())
    }

    fn rekey(&self, class_name: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.repository()?.rename(class_name, old_name, new_name);
        Ok(())
    }

    fn sync(
        &self,
        target: ProtocolSide,
        class_name: &str,
        object_name: &str,
        slot_name: &str,
        params: QVariantList,
    ) -> Result<()> {
        if target == self.protocol_side() {
            return Ok(());
        }
        self.emit(&SignalProxyMessage::Sync {
            class_name: class_name.to_owned(),
            object_name: object_name.to_owned(),
            slot_name: slot_name.to_owned(),
            params,
        })
    }

    fn rpc(&self, target: ProtocolSide, slot_name: &str, params: QVariantList) -> Result<()> {
        if target == self.protocol_side() {
            return Ok(());
        }
        self.emit(&SignalProxyMessage::Rpc {
            slot_name: slot_name.to_owned(),
            params,
        })
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("objects", &self.object_count())
            .field("pending_init", &self.init_tracker.pending())
            .finish()
    }
}
