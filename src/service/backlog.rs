//! # Backlog
//!
//! Historic messages are fetched with `requestBacklog*` syncs on the
//! `BacklogManager` object. The core answers with the matching
//! `receiveBacklog*` sync, repeating every request parameter before the
//! message list. Replies carry no request id, so a request and its reply
//! meet on a [`KeyedQueue`] keyed by those parameters.

use std::any::Any;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::models::{BufferId, Message, MessageFlag, MessageType, MsgId};
use crate::core::variant::{QVariant, QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::MethodTable;
use crate::protocol::syncable::{ProtocolSide, Syncable, SyncableHandle, SyncableState};
use crate::utils::timeout::with_timeout_error;
use crate::utils::KeyedQueue;

pub const BACKLOG_MANAGER_CLASS: &str = "BacklogManager";

/// Parameters of one backlog request. Equal requests share a reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BacklogRequest {
    /// Newest messages of one buffer with `first <= id < last`.
    Buffer {
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
    },
    BufferFiltered {
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
        message_type: MessageType,
        flags: MessageFlag,
    },
    /// Oldest messages first, no `additional`.
    BufferForward {
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        message_type: MessageType,
        flags: MessageFlag,
    },
    All {
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
    },
    AllFiltered {
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
        message_type: MessageType,
        flags: MessageFlag,
    },
}

/// "No bound" for `first` and `last`.
pub const UNBOUNDED: MsgId = MsgId(-1);

// Filters travel as plain ints.
fn type_param(message_type: MessageType) -> QVariant {
    QVariant::Int(message_type.bits() as i32)
}

fn flags_param(flags: MessageFlag) -> QVariant {
    QVariant::Int(i32::from(flags.bits()))
}

fn read_type(params: &[QVariant], index: usize, method: &str) -> Result<MessageType> {
    let raw: i32 = QVariant::expect_param(params, index, method)?;
    Ok(MessageType::from_bits_truncate(raw as u32))
}

fn read_flags(params: &[QVariant], index: usize, method: &str) -> Result<MessageFlag> {
    let raw: i32 = QVariant::expect_param(params, index, method)?;
    Ok(MessageFlag::from_bits_truncate(raw as u8))
}

impl BacklogRequest {
    pub fn request_slot(&self) -> &'static str {
        match self {
            BacklogRequest::Buffer { .. } => "requestBacklog",
            BacklogRequest::BufferFiltered { .. } => "requestBacklogFiltered",
            BacklogRequest::BufferForward { .. } => "requestBacklogForward",
            BacklogRequest::All { .. } => "requestBacklogAll",
            BacklogRequest::AllFiltered { .. } => "requestBacklogAllFiltered",
        }
    }

    pub fn receive_slot(&self) -> &'static str {
        match self {
            BacklogRequest::Buffer { .. } => "receiveBacklog",
            BacklogRequest::BufferFiltered { .. } => "receiveBacklogFiltered",
            BacklogRequest::BufferForward { .. } => "receiveBacklogForward",
            BacklogRequest::All { .. } => "receiveBacklogAll",
            BacklogRequest::AllFiltered { .. } => "receiveBacklogAllFiltered",
        }
    }

    /// Sync parameters, in the order both slots share.
    pub fn params(&self) -> QVariantList {
        match *self {
            BacklogRequest::Buffer {
                buffer_id,
                first,
                last,
                limit,
                additional,
            } => vec![
                buffer_id.into(),
                first.into(),
                last.into(),
                limit.into(),
                additional.into(),
            ],
            BacklogRequest::BufferFiltered {
                buffer_id,
                first,
                last,
                limit,
                additional,
                message_type,
                flags,
            } => vec![
                buffer_id.into(),
                first.into(),
                last.into(),
                limit.into(),
                additional.into(),
                type_param(message_type),
                flags_param(flags),
            ],
            BacklogRequest::BufferForward {
                buffer_id,
                first,
                last,
                limit,
                message_type,
                flags,
            } => vec![
                buffer_id.into(),
                first.into(),
                last.into(),
                limit.into(),
                type_param(message_type),
                flags_param(flags),
            ],
            BacklogRequest::All {
                first,
                last,
                limit,
                additional,
            } => vec![first.into(), last.into(), limit.into(), additional.into()],
            BacklogRequest::AllFiltered {
                first,
                last,
                limit,
                additional,
                message_type,
                flags,
            } => vec![
                first.into(),
                last.into(),
                limit.into(),
                additional.into(),
                type_param(message_type),
                flags_param(flags),
            ],
        }
    }

    /// Split a `receive*` parameter list into its request and messages.
    fn from_reply(slot: &str, params: &[QVariant]) -> Result<(Self, QVariantList)> {
        let (request, messages_at) = match slot {
            "receiveBacklog" => (
                BacklogRequest::Buffer {
                    buffer_id: typed(params, 0, slot)?,
                    first: typed(params, 1, slot)?,
                    last: typed(params, 2, slot)?,
                    limit: typed(params, 3, slot)?,
                    additional: typed(params, 4, slot)?,
                },
                5,
            ),
            "receiveBacklogFiltered" => (
                BacklogRequest::BufferFiltered {
                    buffer_id: typed(params, 0, slot)?,
                    first: typed(params, 1, slot)?,
                    last: typed(params, 2, slot)?,
                    limit: typed(params, 3, slot)?,
                    additional: typed(params, 4, slot)?,
                    message_type: read_type(params, 5, slot)?,
                    flags: read_flags(params, 6, slot)?,
                },
                7,
            ),
            "receiveBacklogForward" => (
                BacklogRequest::BufferForward {
                    buffer_id: typed(params, 0, slot)?,
                    first: typed(params, 1, slot)?,
                    last: typed(params, 2, slot)?,
                    limit: typed(params, 3, slot)?,
                    message_type: read_type(params, 4, slot)?,
                    flags: read_flags(params, 5, slot)?,
                },
                6,
            ),
            "receiveBacklogAll" => (
                BacklogRequest::All {
                    first: typed(params, 0, slot)?,
                    last: typed(params, 1, slot)?,
                    limit: typed(params, 2, slot)?,
                    additional: typed(params, 3, slot)?,
                },
                4,
            ),
            "receiveBacklogAllFiltered" => (
                BacklogRequest::AllFiltered {
                    first: typed(params, 0, slot)?,
                    last: typed(params, 1, slot)?,
                    limit: typed(params, 2, slot)?,
                    additional: typed(params, 3, slot)?,
                    message_type: read_type(params, 4, slot)?,
                    flags: read_flags(params, 5, slot)?,
                },
                6,
            ),
            other => {
                return Err(ProtocolError::UnknownMethod {
                    class_name: BACKLOG_MANAGER_CLASS.into(),
                    method: other.into(),
                })
            }
        };
        let messages: QVariantList = typed(params, messages_at, slot)?;
        Ok((request, messages))
    }
}

fn typed<T: crate::core::variant::FromQVariant>(
    params: &[QVariant],
    index: usize,
    method: &str,
) -> Result<T> {
    QVariant::expect_param(params, index, method)
}

/// The synchronized `BacklogManager` object.
pub struct BacklogManager {
    state: SyncableState,
    queue: Arc<KeyedQueue<BacklogRequest, QVariantList>>,
}

impl BacklogManager {
    pub fn new(queue: Arc<KeyedQueue<BacklogRequest, QVariantList>>) -> Self {
        Self {
            state: SyncableState::new(BACKLOG_MANAGER_CLASS, ""),
            queue,
        }
    }

    fn receive(&mut self, slot: &'static str, params: &[QVariant]) -> Result<()> {
        let (request, messages) = BacklogRequest::from_reply(slot, params)?;
        let woken = self.queue.resume(&request, messages);
        debug!(slot, woken, "Backlog received");
        Ok(())
    }

    fn receive_backlog(&mut self, params: &[QVariant]) -> Result<()> {
        self.receive("receiveBacklog", params)
    }

    fn receive_backlog_filtered(&mut self, params: &[QVariant]) -> Result<()> {
        self.receive("receiveBacklogFiltered", params)
    }

    fn receive_backlog_forward(&mut self, params: &[QVariant]) -> Result<()> {
        self.receive("receiveBacklogForward", params)
    }

    fn receive_backlog_all(&mut self, params: &[QVariant]) -> Result<()> {
        self.receive("receiveBacklogAll", params)
    }

    fn receive_backlog_all_filtered(&mut self, params: &[QVariant]) -> Result<()> {
        self.receive("receiveBacklogAllFiltered", params)
    }

    pub fn invoker() -> MethodTable<BacklogManager> {
        MethodTable::new(BACKLOG_MANAGER_CLASS)
            .method("receiveBacklog", Self::receive_backlog)
            .method("receiveBacklogFiltered", Self::receive_backlog_filtered)
            .method("receiveBacklogForward", Self::receive_backlog_forward)
            .method("receiveBacklogAll", Self::receive_backlog_all)
            .method("receiveBacklogAllFiltered", Self::receive_backlog_all_filtered)
    }
}

impl Syncable for BacklogManager {
    fn state(&self) -> &SyncableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SyncableState {
        &mut self.state
    }

    // No properties.
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

/// Awaitable backlog requests.
pub struct ClientBacklogManager {
    handle: Arc<std::sync::Mutex<BacklogManager>>,
    queue: Arc<KeyedQueue<BacklogRequest, QVariantList>>,
    timeout: Duration,
}

impl ClientBacklogManager {
    pub fn new(timeout: Duration) -> Self {
        let queue = Arc::new(KeyedQueue::new());
        Self {
            handle: Arc::new(std::sync::Mutex::new(BacklogManager::new(queue.clone()))),
            queue,
            timeout,
        }
    }

    /// The object to hand to the session for synchronization.
    pub fn handle(&self) -> SyncableHandle {
        self.handle.clone()
    }

    fn object(&self) -> Result<MutexGuard<'_, BacklogManager>> {
        self.handle
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))
    }

    pub fn is_initialized(&self) -> bool {
        self.object().map(|o| o.state().initialized()).unwrap_or(false)
    }

    /// Send `request` and wait for the core's matching reply.
    #[instrument(skip(self), fields(slot = request.request_slot()))]
    pub async fn request(&self, request: BacklogRequest) -> Result<Vec<Message>> {
        let slot = request.request_slot();
        let params = request.params();
        let raw = with_timeout_error(
            self.queue.wait([request], || {
                let object = self.object()?;
                if !object.state().initialized() {
                    return Err(ProtocolError::SyncableNotFound {
                        class_name: BACKLOG_MANAGER_CLASS.into(),
                        object_name: String::new(),
                    });
                }
                object.sync(ProtocolSide::Core, slot, params)
            }),
            self.timeout,
        )
        .await?;
        Ok(to_messages(raw))
    }

    pub async fn backlog(
        &self,
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
    ) -> Result<Vec<Message>> {
        self.request(BacklogRequest::Buffer {
            buffer_id,
            first,
            last,
            limit,
            additional,
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn backlog_filtered(
        &self,
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
        message_type: MessageType,
        flags: MessageFlag,
    ) -> Result<Vec<Message>> {
        self.request(BacklogRequest::BufferFiltered {
            buffer_id,
            first,
            last,
            limit,
            additional,
            message_type,
            flags,
        })
        .await
    }

    pub async fn backlog_forward(
        &self,
        buffer_id: BufferId,
        first: MsgId,
        last: MsgId,
        limit: i32,
        message_type: MessageType,
        flags: MessageFlag,
    ) -> Result<Vec<Message>> {
        self.request(BacklogRequest::BufferForward {
            buffer_id,
            first,
            last,
            limit,
            message_type,
            flags,
        })
        .await
    }

    pub async fn backlog_all(
        &self,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
    ) -> Result<Vec<Message>> {
        self.request(BacklogRequest::All {
            first,
            last,
            limit,
            additional,
        })
        .await
    }

    pub async fn backlog_all_filtered(
        &self,
        first: MsgId,
        last: MsgId,
        limit: i32,
        additional: i32,
        message_type: MessageType,
        flags: MessageFlag,
    ) -> Result<Vec<Message>> {
        self.request(BacklogRequest::AllFiltered {
            first,
            last,
            limit,
            additional,
            message_type,
            flags,
        })
        .await
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Fail every outstanding and future request.
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Entries that are not messages are skipped.
fn to_messages(raw: QVariantList) -> Vec<Message> {
    raw.iter().filter_map(|entry| entry.get::<Message>()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::dispatcher::Invoker;

    fn filtered() -> BacklogRequest {
        BacklogRequest::BufferFiltered {
            buffer_id: BufferId(4),
            first: UNBOUNDED,
            last: MsgId(100),
            limit: 50,
            additional: 0,
            message_type: MessageType::PLAIN | MessageType::ACTION,
            flags: MessageFlag::HIGHLIGHT,
        }
    }

    #[test]
    fn reply_params_rebuild_the_request() {
        for request in [
            BacklogRequest::Buffer {
                buffer_id: BufferId(1),
                first: UNBOUNDED,
                last: UNBOUNDED,
                limit: -1,
                additional: 0,
            },
            filtered(),
            BacklogRequest::BufferForward {
                buffer_id: BufferId(2),
                first: MsgId(10),
                last: UNBOUNDED,
                limit: 20,
                message_type: MessageType::NOTICE,
                flags: MessageFlag::empty(),
            },
            BacklogRequest::All {
                first: UNBOUNDED,
                last: UNBOUNDED,
                limit: 5,
                additional: 1,
            },
            BacklogRequest::AllFiltered {
                first: UNBOUNDED,
                last: UNBOUNDED,
                limit: 5,
                additional: 1,
                message_type: MessageType::PLAIN,
                flags: MessageFlag::SELF,
            },
        ] {
            let mut params = request.params();
            params.push(QVariant::QVariantList(vec![]));
            let (parsed, messages) =
                BacklogRequest::from_reply(request.receive_slot(), &params).unwrap();
            assert_eq!(parsed, request);
            assert!(messages.is_empty());
        }
    }

    #[test]
    fn all_filtered_uses_its_own_slot() {
        let request = BacklogRequest::AllFiltered {
            first: UNBOUNDED,
            last: UNBOUNDED,
            limit: -1,
            additional: 0,
            message_type: MessageType::PLAIN,
            flags: MessageFlag::empty(),
        };
        assert_eq!(request.request_slot(), "requestBacklogAllFiltered");
        assert_eq!(request.params().len(), 6);
    }

    #[test]
    fn missing_message_list_is_rejected() {
        let params = filtered().params();
        let result = BacklogRequest::from_reply("receiveBacklogFiltered", &params);
        assert!(matches!(
            result,
            Err(ProtocolError::WrongParameterType { index: 7, .. })
        ));
    }

    #[tokio::test]
    async fn uninitialized_manager_fails_fast() {
        let backlog = ClientBacklogManager::new(Duration::from_secs(1));
        let result = backlog
            .backlog(BufferId(1), UNBOUNDED, UNBOUNDED, 10, 0)
            .await;
        assert!(matches!(result, Err(ProtocolError::SyncableNotFound { .. })));
        assert_eq!(backlog.pending(), 0);
    }

    #[tokio::test]
    async fn reply_wakes_the_matching_request() {
        let backlog = Arc::new(ClientBacklogManager::new(Duration::from_secs(1)));
        backlog.handle.lock().unwrap().state_mut().set_initialized(true);

        let waiting = {
            let backlog = backlog.clone();
            tokio::spawn(async move { backlog.request(filtered()).await })
        };
        while backlog.pending() == 0 {
            tokio::task::yield_now().await;
        }

        let mut params = filtered().params();
        params.push(QVariant::QVariantList(vec![QVariant::Int(1)]));
        let mut object = backlog.handle.lock().unwrap();
        BacklogManager::invoker()
            .invoke(&mut *object, "receiveBacklogFiltered", &params)
            .unwrap();
        drop(object);

        // Not a message, skipped.
        assert!(waiting.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let backlog = ClientBacklogManager::new(Duration::from_secs(1));
        backlog.close();
        let result = backlog.backlog_all(UNBOUNDED, UNBOUNDED, 1, 0).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
