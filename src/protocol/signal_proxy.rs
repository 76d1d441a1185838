//! # Signal Proxy Messages
//!
//! Everything exchanged after `SessionInit` is one of these six messages.
//!
//! ## Wire Format
//! A frame payload is a `QVariantList` whose first item is a boxed `Int`
//! naming the message type. Class, object and slot names are `QByteArray`s
//! holding UTF-8.
//!
//! | Type | Id | Items after the id |
//! |------|----|--------------------|
//! | Sync | 1 | class, object, slot, params... |
//! | Rpc | 2 | slot, params... |
//! | InitRequest | 3 | class, object |
//! | InitData | 4 | class, object, key, value, key, value... |
//! | HeartBeat | 5 | QDateTime |
//! | HeartBeatReply | 6 | QDateTime |

use bytes::{Bytes, BytesMut};

use crate::core::features::FeatureSet;
use crate::core::serializer::SerializerRegistry;
use crate::core::variant::{QDateTime, QVariant, QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};

pub mod message_type {
    pub const SYNC: i32 = 1;
    pub const RPC: i32 = 2;
    pub const INIT_REQUEST: i32 = 3;
    pub const INIT_DATA: i32 = 4;
    pub const HEART_BEAT: i32 = 5;
    pub const HEART_BEAT_REPLY: i32 = 6;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalProxyMessage {
    Sync {
        class_name: String,
        object_name: String,
        slot_name: String,
        params: QVariantList,
    },
    Rpc {
        slot_name: String,
        params: QVariantList,
    },
    InitRequest {
        class_name: String,
        object_name: String,
    },
    InitData {
        class_name: String,
        object_name: String,
        init_data: QVariantMap,
    },
    HeartBeat(QDateTime),
    HeartBeatReply(QDateTime),
}

fn name_at(list: &[QVariant], index: usize, what: &str) -> Result<String> {
    list.get(index)
        .and_then(QVariant::as_byte_string)
        .ok_or_else(|| ProtocolError::MalformedValue(format!("signal proxy {what} missing")))
}

fn timestamp_at(list: &[QVariant]) -> Result<QDateTime> {
    list.get(1)
        .and_then(|v| v.get::<QDateTime>())
        .ok_or_else(|| ProtocolError::MalformedValue("heartbeat without timestamp".into()))
}

impl SignalProxyMessage {
    pub fn message_type(&self) -> i32 {
        match self {
            SignalProxyMessage::Sync { .. } => message_type::SYNC,
            SignalProxyMessage::Rpc { .. } => message_type::RPC,
            SignalProxyMessage::InitRequest { .. } => message_type::INIT_REQUEST,
            SignalProxyMessage::InitData { .. } => message_type::INIT_DATA,
            SignalProxyMessage::HeartBeat(_) => message_type::HEART_BEAT,
            SignalProxyMessage::HeartBeatReply(_) => message_type::HEART_BEAT_REPLY,
        }
    }

    pub fn to_list(&self) -> QVariantList {
        let mut list = vec![QVariant::Int(self.message_type())];
        match self {
            SignalProxyMessage::Sync {
                class_name,
                object_name,
                slot_name,
                params,
            } => {
                list.push(QVariant::byte_string(class_name));
                list.push(QVariant::byte_string(object_name));
                list.push(QVariant::byte_string(slot_name));
                list.extend(params.iter().cloned());
            }
            SignalProxyMessage::Rpc { slot_name, params } => {
                list.push(QVariant::byte_string(slot_name));
                list.extend(params.iter().cloned());
            }
            SignalProxyMessage::InitRequest {
                class_name,
                object_name,
            } => {
                list.push(QVariant::byte_string(class_name));
                list.push(QVariant::byte_string(object_name));
            }
            SignalProxyMessage::InitData {
                class_name,
                object_name,
                init_data,
            } => {
                list.push(QVariant::byte_string(class_name));
                list.push(QVariant::byte_string(object_name));
                for (key, value) in init_data {
                    list.push(QVariant::byte_string(key));
                    list.push(value.clone());
                }
            }
            SignalProxyMessage::HeartBeat(ts) | SignalProxyMessage::HeartBeatReply(ts) => {
                list.push(QVariant::QDateTime(ts.clone()));
            }
        }
        list
    }

    pub fn from_list(list: QVariantList) -> Result<Self> {
        let kind = match list.first() {
            Some(QVariant::Int(kind)) => *kind,
            Some(other) => {
                return Err(ProtocolError::MalformedValue(format!(
                    "signal proxy type must be Int, got {}",
                    other.tag()
                )))
            }
            None => {
                return Err(ProtocolError::MalformedValue(
                    constants::ERR_EMPTY_SIGNAL_PROXY.into(),
                ))
            }
        };

        let message = match kind {
            message_type::SYNC => SignalProxyMessage::Sync {
                class_name: name_at(&list, 1, "class name")?,
                object_name: name_at(&list, 2, "object name")?,
                slot_name: name_at(&list, 3, "slot name")?,
                params: list.into_iter().skip(4).collect(),
            },
            message_type::RPC => SignalProxyMessage::Rpc {
                slot_name: name_at(&list, 1, "slot name")?,
                params: list.into_iter().skip(2).collect(),
            },
            message_type::INIT_REQUEST => SignalProxyMessage::InitRequest {
                class_name: name_at(&list, 1, "class name")?,
                object_name: name_at(&list, 2, "object name")?,
            },
            message_type::INIT_DATA => {
                let class_name = name_at(&list, 1, "class name")?;
                let object_name = name_at(&list, 2, "object name")?;
                let mut init_data = QVariantMap::new();
                let mut rest = list.into_iter().skip(3);
                while let Some(key) = rest.next() {
                    let key = key.as_byte_string().ok_or_else(|| {
                        ProtocolError::MalformedValue(format!(
                            "init data key of type {} for {class_name}:{object_name}",
                            key.tag()
                        ))
                    })?;
                    let value = rest.next().ok_or_else(|| {
                        ProtocolError::MalformedValue(format!("init data key '{key}' has no value"))
                    })?;
                    init_data.insert(key, value);
                }
                SignalProxyMessage::InitData {
                    class_name,
                    object_name,
                    init_data,
                }
            }
            message_type::HEART_BEAT => SignalProxyMessage::HeartBeat(timestamp_at(&list)?),
            message_type::HEART_BEAT_REPLY => {
                SignalProxyMessage::HeartBeatReply(timestamp_at(&list)?)
            }
            other => {
                return Err(ProtocolError::MalformedValue(format!(
                    "unknown signal proxy message type {other}"
                )))
            }
        };
        Ok(message)
    }

    /// Encode as a frame payload.
    pub fn serialize(&self, registry: &SerializerRegistry, features: &FeatureSet) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        registry.serialize_list(&mut buf, &self.to_list(), features)?;
        Ok(buf.freeze())
    }

    pub fn deserialize(
        mut payload: Bytes,
        registry: &SerializerRegistry,
        features: &FeatureSet,
    ) -> Result<Self> {
        Self::from_list(registry.deserialize_list(&mut payload, features)?)
    }
}
