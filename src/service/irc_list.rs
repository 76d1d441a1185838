//! # Channel Listings
//!
//! Listing the channels of a network takes two rounds on the
//! `IrcListHelper` object. `requestChannelList` with the caller's filters
//! starts a search on the core, which answers `reportFinishedList` once the
//! IRC server is done. A second `requestChannelList` without filters then
//! fetches the result through `receiveChannelList`.
//!
//! `reportError` names no network, so it fails every listing in flight.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::models::NetworkId;
use crate::core::variant::{QVariant, QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::MethodTable;
use crate::protocol::syncable::{ProtocolSide, Syncable, SyncableHandle, SyncableState};
use crate::utils::timeout::with_timeout_error;
use crate::utils::KeyedQueue;

pub const IRC_LIST_HELPER_CLASS: &str = "IrcListHelper";

pub mod slots {
    pub const REQUEST_CHANNEL_LIST: &str = "requestChannelList";
    pub const RECEIVE_CHANNEL_LIST: &str = "receiveChannelList";
    pub const REPORT_FINISHED_LIST: &str = "reportFinishedList";
    pub const REPORT_ERROR: &str = "reportError";
}

/// One row of a channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescription {
    pub network_id: NetworkId,
    pub channel_name: String,
    pub user_count: u32,
    pub topic: String,
}

impl ChannelDescription {
    /// Rows are `[name, users, topic]`. Anything else is skipped.
    fn from_row(network_id: NetworkId, row: &QVariant) -> Option<Self> {
        let columns: QVariantList = row.get()?;
        if columns.len() != 3 {
            return None;
        }
        Some(Self {
            network_id,
            channel_name: columns[0].get().unwrap_or_default(),
            user_count: columns[1].get().unwrap_or_default(),
            topic: columns[2].get().unwrap_or_default(),
        })
    }
}

/// What the core sent for a network.
#[derive(Debug, Clone)]
enum ListReply {
    Finished,
    Channels(QVariantList),
    Failed(String),
}

/// The synchronized `IrcListHelper` object.
///
/// It has no state of its own and is live from the start; the core never
/// sends `InitData` for it.
pub struct IrcListHelper {
    state: SyncableState,
    queue: Arc<KeyedQueue<NetworkId, ListReply>>,
}

impl IrcListHelper {
    fn new(queue: Arc<KeyedQueue<NetworkId, ListReply>>) -> Self {
        let mut state = SyncableState::new(IRC_LIST_HELPER_CLASS, "");
        state.set_initialized(true);
        Self { state, queue }
    }

    fn receive_channel_list(&mut self, params: &[QVariant]) -> Result<()> {
        let network_id: NetworkId = QVariant::expect_param(params, 0, slots::RECEIVE_CHANNEL_LIST)?;
        let _filters: Vec<String> = QVariant::expect_param(params, 1, slots::RECEIVE_CHANNEL_LIST)?;
        let channels: QVariantList = QVariant::expect_param(params, 2, slots::RECEIVE_CHANNEL_LIST)?;
        let woken = self.queue.resume(&network_id, ListReply::Channels(channels));
        debug!(network = network_id.0, woken, "Channel list received");
        Ok(())
    }

    fn report_finished_list(&mut self, params: &[QVariant]) -> Result<()> {
        let network_id: NetworkId = QVariant::expect_param(params, 0, slots::REPORT_FINISHED_LIST)?;
        self.queue.resume(&network_id, ListReply::Finished);
        Ok(())
    }

    fn report_error(&mut self, params: &[QVariant]) -> Result<()> {
        let error: Option<String> = QVariant::expect_param(params, 0, slots::REPORT_ERROR)?;
        let error = error.unwrap_or_else(|| constants::ERR_UNKNOWN.to_owned());
        let failed = self.queue.resume_all(ListReply::Failed(error.clone()));
        warn!(%error, failed, "Core failed to list channels");
        Ok(())
    }

    pub fn invoker() -> MethodTable<IrcListHelper> {
        MethodTable::new(IRC_LIST_HELPER_CLASS)
            .method(slots::RECEIVE_CHANNEL_LIST, Self::receive_channel_list)
            .method(slots::REPORT_FINISHED_LIST, Self::report_finished_list)
            .method(slots::REPORT_ERROR, Self::report_error)
    }
}

impl Syncable for IrcListHelper {
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

/// Awaitable channel listings.
pub struct ClientIrcListHelper {
    handle: Arc<Mutex<IrcListHelper>>,
    queue: Arc<KeyedQueue<NetworkId, ListReply>>,
    timeout: Duration,
}

impl ClientIrcListHelper {
    pub fn new(timeout: Duration) -> Self {
        let queue = Arc::new(KeyedQueue::new());
        Self {
            handle: Arc::new(Mutex::new(IrcListHelper::new(queue.clone()))),
            queue,
            timeout,
        }
    }

    /// The object to hand to the session for synchronization.
    pub fn handle(&self) -> SyncableHandle {
        self.handle.clone()
    }

    fn object(&self) -> Result<MutexGuard<'_, IrcListHelper>> {
        self.handle
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))
    }

    fn request(&self, network_id: NetworkId, filters: Vec<String>) -> Result<()> {
        let object = self.object()?;
        if object.state().proxy().is_none() {
            return Err(ProtocolError::SyncableNotFound {
                class_name: IRC_LIST_HELPER_CLASS.into(),
                object_name: String::new(),
            });
        }
        object.sync(
            ProtocolSide::Core,
            slots::REQUEST_CHANNEL_LIST,
            vec![network_id.into(), QVariant::string_list(filters)],
        )
    }

    /// Channels on `network_id` matching `filters`, once the core has
    /// collected them.
    #[instrument(skip(self))]
    pub async fn channel_list(
        &self,
        network_id: NetworkId,
        filters: Vec<String>,
    ) -> Result<Vec<ChannelDescription>> {
        with_timeout_error(self.search_and_fetch(network_id, filters), self.timeout).await
    }

    async fn search_and_fetch(
        &self,
        network_id: NetworkId,
        filters: Vec<String>,
    ) -> Result<Vec<ChannelDescription>> {
        let mut search = Some(filters);
        loop {
            let reply = self
                .queue
                .wait([network_id], || match search.take() {
                    Some(filters) => self.request(network_id, filters),
                    None => Ok(()),
                })
                .await?;
            match reply {
                ListReply::Finished => break,
                ListReply::Failed(error) => return Err(ProtocolError::ChannelListError(error)),
                // Another listing on the same network fetched its result.
                ListReply::Channels(_) => continue,
            }
        }

        let mut fetch = true;
        loop {
            let reply = self
                .queue
                .wait([network_id], || {
                    if std::mem::take(&mut fetch) {
                        self.request(network_id, Vec::new())
                    } else {
                        Ok(())
                    }
                })
                .await?;
            match reply {
                ListReply::Channels(rows) => {
                    return Ok(rows
                        .iter()
                        .filter_map(|row| ChannelDescription::from_row(network_id, row))
                        .collect())
                }
                ListReply::Failed(error) => return Err(ProtocolError::ChannelListError(error)),
                ListReply::Finished => continue,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Fail every outstanding and future listing.
    pub fn close(&self) {
        self.queue.close();
    }
}
