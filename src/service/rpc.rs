//! RPCs the core sends to every client, surfaced as [`SessionEvent`]s.

use std::any::Any;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::core::models::{BufferInfo, IdentityId, Message, NetworkId};
use crate::core::variant::{QVariant, QVariantMap};
use crate::error::Result;
use crate::protocol::dispatcher::MethodTable;
use crate::protocol::syncable::{ProtocolSide, Syncable, SyncableState};
use crate::service::session::RPC_HANDLER_CLASS;

pub mod slots {
    pub const DISPLAY_MSG: &str = "2displayMsg(Message)";
    pub const DISPLAY_STATUS_MSG: &str = "2displayStatusMsg(QString,QString)";
    pub const OBJECT_RENAMED: &str = "__objectRenamed__";
    pub const BUFFER_INFO_UPDATED: &str = "2bufferInfoUpdated(BufferInfo)";
    pub const IDENTITY_CREATED: &str = "2identityCreated(Identity)";
    pub const IDENTITY_REMOVED: &str = "2identityRemoved(IdentityId)";
    pub const NETWORK_CREATED: &str = "2networkCreated(NetworkId)";
    pub const NETWORK_REMOVED: &str = "2networkRemoved(NetworkId)";
    pub const PASSWORD_CHANGED: &str = "2passwordChanged(PeerPtr,bool)";
    pub const DISCONNECT_FROM_CORE: &str = "2disconnectFromCore()";
    pub const SEND_INPUT: &str = "2sendInput(BufferInfo,QString)";
}

/// Something the core told this client about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DisplayMessage(Box<Message>),
    DisplayStatusMessage { network: String, message: String },
    ObjectRenamed {
        class_name: String,
        new_name: String,
        old_name: String,
    },
    BufferInfoUpdated(BufferInfo),
    IdentityCreated(QVariantMap),
    IdentityRemoved(IdentityId),
    NetworkCreated(NetworkId),
    NetworkRemoved(NetworkId),
    PasswordChanged { peer: u64, success: bool },
    /// The core asked this client to go away.
    DisconnectFromCore,
    /// The connection ended.
    Closed,
}

pub struct ClientRpcHandler {
    state: SyncableState,
    events: broadcast::Sender<SessionEvent>,
}

impl ClientRpcHandler {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        let mut state = SyncableState::new(RPC_HANDLER_CLASS, "");
        // Local object, there is no InitData for it.
        state.set_initialized(true);
        Self { state, events }
    }

    fn publish(&self, event: SessionEvent) {
        trace!(?event, "Session event");
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Send a line of input to a buffer, as if typed by the user.
    pub fn send_input(&self, buffer_info: BufferInfo, input: &str) -> Result<()> {
        self.rpc(
            ProtocolSide::Core,
            slots::SEND_INPUT,
            vec![QVariant::BufferInfo(buffer_info), QVariant::from(input)],
        )
    }

    fn display_msg(&mut self, params: &[QVariant]) -> Result<()> {
        let message: Message = QVariant::expect_param(params, 0, slots::DISPLAY_MSG)?;
        self.publish(SessionEvent::DisplayMessage(Box::new(message)));
        Ok(())
    }

    fn display_status_msg(&mut self, params: &[QVariant]) -> Result<()> {
        let network = QVariant::expect_param(params, 0, slots::DISPLAY_STATUS_MSG)?;
        let message = QVariant::expect_param(params, 1, slots::DISPLAY_STATUS_MSG)?;
        self.publish(SessionEvent::DisplayStatusMessage { network, message });
        Ok(())
    }

    fn object_renamed(&mut self, params: &[QVariant]) -> Result<()> {
        let class_name = params
            .first()
            .and_then(QVariant::as_byte_string)
            .ok_or_else(|| crate::error::ProtocolError::WrongParameterType {
                method: slots::OBJECT_RENAMED.into(),
                index: 0,
            })?;
        let new_name: String = QVariant::expect_param(params, 1, slots::OBJECT_RENAMED)?;
        let old_name: String = QVariant::expect_param(params, 2, slots::OBJECT_RENAMED)?;
        debug!(class = %class_name, from = %old_name, to = %new_name, "Core renamed object");
        if let Some(proxy) = self.state.proxy() {
            proxy.rename(&class_name, &old_name, &new_name)?;
        }
        self.publish(SessionEvent::ObjectRenamed {
            class_name,
            new_name,
            old_name,
        });
        Ok(())
    }

    fn buffer_info_updated(&mut self, params: &[QVariant]) -> Result<()> {
        let info = QVariant::expect_param(params, 0, slots::BUFFER_INFO_UPDATED)?;
        self.publish(SessionEvent::BufferInfoUpdated(info));
        Ok(())
    }

    fn identity_created(&mut self, params: &[QVariant]) -> Result<()> {
        let identity = QVariant::expect_param(params, 0, slots::IDENTITY_CREATED)?;
        self.publish(SessionEvent::IdentityCreated(identity));
        Ok(())
    }

    fn identity_removed(&mut self, params: &[QVariant]) -> Result<()> {
        let id = QVariant::expect_param(params, 0, slots::IDENTITY_REMOVED)?;
        self.publish(SessionEvent::IdentityRemoved(id));
        Ok(())
    }

    fn network_created(&mut self, params: &[QVariant]) -> Result<()> {
        let id = QVariant::expect_param(params, 0, slots::NETWORK_CREATED)?;
        self.publish(SessionEvent::NetworkCreated(id));
        Ok(())
    }

    fn network_removed(&mut self, params: &[QVariant]) -> Result<()> {
        let id = QVariant::expect_param(params, 0, slots::NETWORK_REMOVED)?;
        self.publish(SessionEvent::NetworkRemoved(id));
        Ok(())
    }

    fn password_changed(&mut self, params: &[QVariant]) -> Result<()> {
        let peer = match params.first() {
            Some(QVariant::PeerPtr(peer)) => *peer,
            _ => 0,
        };
        let success = QVariant::expect_param(params, 1, slots::PASSWORD_CHANGED)?;
        self.publish(SessionEvent::PasswordChanged { peer, success });
        Ok(())
    }

    fn disconnect_from_core(&mut self, _params: &[QVariant]) -> Result<()> {
        self.publish(SessionEvent::DisconnectFromCore);
        Ok(())
    }

    /// Slot table for the client side.
    pub fn invoker() -> MethodTable<ClientRpcHandler> {
        MethodTable::new(RPC_HANDLER_CLASS)
            .method(slots::DISPLAY_MSG, Self::display_msg)
            .method(slots::DISPLAY_STATUS_MSG, Self::display_status_msg)
            .method(slots::OBJECT_RENAMED, Self::object_renamed)
            .method(slots::BUFFER_INFO_UPDATED, Self::buffer_info_updated)
            .method(slots::IDENTITY_CREATED, Self::identity_created)
            .method(slots::IDENTITY_REMOVED, Self::identity_removed)
            .method(slots::NETWORK_CREATED, Self::network_created)
            .method(slots::NETWORK_REMOVED, Self::network_removed)
            .method(slots::PASSWORD_CHANGED, Self::password_changed)
            .method(slots::DISCONNECT_FROM_CORE, Self::disconnect_from_core)
    }
}

impl Syncable for ClientRpcHandler {
    fn state(&self) -> &SyncableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SyncableState {
        &mut self.state
    }

    fn from_variant_map(&mut self, _properties: &QVariantMap) -> Result<()> {
        Ok(())
    }

    fn to_variant_map(&self) -> QVariantMap {
        QVariantMap::new()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
