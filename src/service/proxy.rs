//! Last handler in the chain: every frame after `SessionInit` is a signal
//! proxy message for the session.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::service::backlog::ClientBacklogManager;
use crate::service::channel::ConnectionHandler;
use crate::service::irc_list::ClientIrcListHelper;
use crate::service::rpc::SessionEvent;
use crate::service::session::ClientSession;

pub struct ProxyMessageHandler {
    session: Arc<ClientSession>,
    backlog: Arc<ClientBacklogManager>,
    irc_list: Arc<ClientIrcListHelper>,
    events: broadcast::Sender<SessionEvent>,
}

impl ProxyMessageHandler {
    pub fn new(
        session: Arc<ClientSession>,
        backlog: Arc<ClientBacklogManager>,
        irc_list: Arc<ClientIrcListHelper>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            session,
            backlog,
            irc_list,
            events,
        }
    }
}

impl ConnectionHandler for ProxyMessageHandler {
    fn name(&self) -> &'static str {
        "signal_proxy"
    }

    fn init(&self) -> Result<()> {
        debug!("Signal proxy active");
        Ok(())
    }

    fn read(&self, frame: Bytes) -> Result<bool> {
        let message = self.session.sink().context().decode_signal_proxy(frame)?;
        self.session.dispatch(message)?;
        Ok(false)
    }

    fn close(&self) {
        self.backlog.close();
        self.irc_list.close();
        self.session.clear();
        let _ = self.events.send(SessionEvent::Closed);
    }
}
