//! # Serializer Registry
//!
//! Maps every wire type id and user type name to the pair of functions that
//! know its payload layout. A registry is an ordinary value: build it once with
//! [`SerializerRegistry::standard`] and hand it by reference to whatever needs
//! to encode or decode.
//!
//! ## Boxed Layout
//! ```text
//! [TypeId i32] [IsNull u8] ([TypeName ascii] if TypeId == 127) [Payload]
//! ```
//! The is-null byte is always written as zero and ignored when read.
//!
//! Containers (lists, maps, nested variants) may nest at most
//! [`MAX_NESTING_DEPTH`] levels deep when decoding.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

use crate::core::features::{FeatureSet, QuasselFeature};
use crate::core::models::{
    BufferId, BufferInfo, BufferType, IdentityId, Message, MessageFlag, MessageType, MsgId,
    NetworkId, NetworkLayerProtocol,
};
use crate::core::primitive::*;
use crate::core::types::{QtType, QuasselType, TypeTag};
use crate::core::variant::{QVariant, QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};

pub type EncodeFn = fn(&QVariant, &mut BytesMut, &SerializerRegistry, &FeatureSet) -> Result<()>;
/// Decoders receive the nesting depth of the value they decode and pass
/// `depth + 1` to anything nested inside it.
pub type DecodeFn = fn(&mut Bytes, &SerializerRegistry, &FeatureSet, usize) -> Result<QVariant>;

/// Deepest container nesting accepted from the wire.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Encoder and decoder for one wire type.
#[derive(Clone, Copy)]
pub struct Serializer {
    pub tag: TypeTag,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer").field("tag", &self.tag).finish()
    }
}

fn mismatch(expected: TypeTag, actual: &QVariant) -> ProtocolError {
    ProtocolError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.tag().to_string(),
    }
}

/// Build a [`Serializer`] for a single-field variant.
macro_rules! serializer {
    ($tag:expr, $variant:ident,
     |$v:ident, $buf:ident, $reg:ident, $feat:ident| $encode:expr,
     |$dbuf:ident, $dreg:ident, $dfeat:ident| $decode:expr $(,)?) => {
        Serializer {
            tag: $tag,
            encode: |value, $buf, $reg, $feat| match value {
                QVariant::$variant($v) => $encode,
                other => Err(mismatch($tag, other)),
            },
            decode: |$dbuf, $dreg, $dfeat, _depth| Ok(QVariant::$variant($decode)),
        }
    };
    ($tag:expr, $variant:ident,
     |$v:ident, $buf:ident, $reg:ident, $feat:ident| $encode:expr,
     |$dbuf:ident, $dreg:ident, $dfeat:ident, $depth:ident| $decode:expr $(,)?) => {
        Serializer {
            tag: $tag,
            encode: |value, $buf, $reg, $feat| match value {
                QVariant::$variant($v) => $encode,
                other => Err(mismatch($tag, other)),
            },
            decode: |$dbuf, $dreg, $dfeat, $depth| Ok(QVariant::$variant($decode)),
        }
    };
}

macro_rules! fixed {
    ($qt:ident, $put:ident, $read:ident) => {
        serializer!(
            TypeTag::Qt(QtType::$qt), $qt,
            |v, buf, _r, _f| { buf.$put(*v); Ok(()) },
            |buf, _r, _f| $read(buf)?,
        )
    };
}

macro_rules! map_shaped {
    ($quassel:ident) => {
        serializer!(
            TypeTag::Quassel(QuasselType::$quassel), $quassel,
            |v, buf, reg, f| reg.serialize_map(buf, v, f),
            |buf, reg, f, depth| reg.deserialize_map_nested(buf, f, depth + 1)?,
        )
    };
}

macro_rules! int_id {
    ($quassel:ident, $ty:ident) => {
        serializer!(
            TypeTag::Quassel(QuasselType::$quassel), $quassel,
            |v, buf, _r, _f| { buf.put_i32(v.0); Ok(()) },
            |buf, _r, _f| $ty(read_i32(buf)?),
        )
    };
}

/// Registry from type id / type name to serializer.
#[derive(Debug, Clone, Default)]
pub struct SerializerRegistry {
    qt: HashMap<i32, Serializer>,
    quassel: HashMap<&'static str, Serializer>,
}

impl SerializerRegistry {
    /// A registry that knows no types at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every Qt and Quassel type a deployed core may send.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for serializer in qt_serializers().into_iter().chain(quassel_serializers()) {
            registry.register(serializer);
        }
        registry
    }

    /// Add or replace the serializer for `serializer.tag`.
    pub fn register(&mut self, serializer: Serializer) {
        match serializer.tag {
            TypeTag::Qt(t) => {
                self.qt.insert(t.id(), serializer);
            }
            TypeTag::Quassel(t) => {
                self.quassel.insert(t.type_name(), serializer);
            }
        }
    }

    pub fn lookup(&self, tag: TypeTag) -> Result<&Serializer> {
        match tag {
            TypeTag::Qt(t) => self
                .qt
                .get(&t.id())
                .ok_or(ProtocolError::UnknownWireType(t.id())),
            TypeTag::Quassel(t) => self
                .quassel
                .get(t.type_name())
                .ok_or_else(|| ProtocolError::UnknownCustomType(t.type_name().to_owned())),
        }
    }

    /// Append `value` as a boxed value.
    pub fn serialize(&self, buf: &mut BytesMut, value: &QVariant, features: &FeatureSet) -> Result<()> {
        let tag = value.tag();
        let serializer = self.lookup(tag)?;
        buf.put_i32(tag.qt_type().id());
        write_bool(buf, false);
        if let TypeTag::Quassel(t) = tag {
            write_ascii(buf, t.type_name())?;
        }
        (serializer.encode)(value, buf, self, features)
    }

    /// Consume one boxed value.
    pub fn deserialize(&self, buf: &mut Bytes, features: &FeatureSet) -> Result<QVariant> {
        self.deserialize_nested(buf, features, 0)
    }

    /// Consume one boxed value found `depth` containers deep.
    pub fn deserialize_nested(
        &self,
        buf: &mut Bytes,
        features: &FeatureSet,
        depth: usize,
    ) -> Result<QVariant> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::MalformedValue(
                constants::ERR_NESTING_TOO_DEEP.into(),
            ));
        }
        let id = read_i32(buf)?;
        let _is_null = read_bool(buf)?;
        let serializer = if id == QtType::UserType.id() {
            let name = read_ascii(buf)?
                .ok_or_else(|| ProtocolError::MalformedValue(constants::ERR_NULL_TYPE_NAME.into()))?;
            self.quassel
                .get(name.as_str())
                .ok_or(ProtocolError::UnknownCustomType(name))?
        } else {
            self.qt.get(&id).ok_or(ProtocolError::UnknownWireType(id))?
        };
        (serializer.decode)(buf, self, features, depth)
    }

    /// Payload only, no type header. Used where both sides know the type.
    pub fn serialize_payload(
        &self,
        buf: &mut BytesMut,
        value: &QVariant,
        features: &FeatureSet,
    ) -> Result<()> {
        let serializer = self.lookup(value.tag())?;
        (serializer.encode)(value, buf, self, features)
    }

    pub fn deserialize_payload(
        &self,
        buf: &mut Bytes,
        tag: TypeTag,
        features: &FeatureSet,
    ) -> Result<QVariant> {
        let serializer = self.lookup(tag)?;
        (serializer.decode)(buf, self, features, 0)
    }

    /// `QVariantList` payload: count then boxed values.
    pub fn serialize_list(&self, buf: &mut BytesMut, list: &[QVariant], features: &FeatureSet) -> Result<()> {
        write_count(buf, list.len())?;
        for item in list {
            self.serialize(buf, item, features)?;
        }
        Ok(())
    }

    pub fn deserialize_list(&self, buf: &mut Bytes, features: &FeatureSet) -> Result<QVariantList> {
        self.deserialize_list_nested(buf, features, 0)
    }

    /// List payload whose items sit at `depth`.
    pub fn deserialize_list_nested(
        &self,
        buf: &mut Bytes,
        features: &FeatureSet,
        depth: usize,
    ) -> Result<QVariantList> {
        let count = read_count(buf)?;
        // Every boxed value takes at least five bytes, cap the preallocation accordingly.
        let mut list = Vec::with_capacity(count.min(buf.len() / 5));
        for _ in 0..count {
            list.push(self.deserialize_nested(buf, features, depth)?);
        }
        Ok(list)
    }

    /// `QVariantMap` payload: count then (QString key, boxed value) pairs.
    pub fn serialize_map(&self, buf: &mut BytesMut, map: &QVariantMap, features: &FeatureSet) -> Result<()> {
        write_count(buf, map.len())?;
        for (key, value) in map {
            write_utf16(buf, Some(key))?;
            self.serialize(buf, value, features)?;
        }
        Ok(())
    }

    pub fn deserialize_map(&self, buf: &mut Bytes, features: &FeatureSet) -> Result<QVariantMap> {
        self.deserialize_map_nested(buf, features, 0)
    }

    /// Map payload whose values sit at `depth`.
    pub fn deserialize_map_nested(
        &self,
        buf: &mut Bytes,
        features: &FeatureSet,
        depth: usize,
    ) -> Result<QVariantMap> {
        let count = read_count(buf)?;
        let mut map = QVariantMap::new();
        for _ in 0..count {
            let key = read_utf16(buf)?.unwrap_or_default();
            let value = self.deserialize_nested(buf, features, depth)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

fn qt_serializers() -> Vec<Serializer> {
    vec![
        Serializer {
            tag: TypeTag::Qt(QtType::Void),
            encode: |value, _buf, _r, _f| match value {
                QVariant::Void => Ok(()),
                other => Err(mismatch(TypeTag::Qt(QtType::Void), other)),
            },
            decode: |_buf, _r, _f, _depth| Ok(QVariant::Void),
        },
        serializer!(
            TypeTag::Qt(QtType::Bool), Bool,
            |v, buf, _r, _f| { write_bool(buf, *v); Ok(()) },
            |buf, _r, _f| read_bool(buf)?,
        ),
        fixed!(Char, put_i8, read_i8),
        fixed!(UChar, put_u8, read_u8),
        fixed!(Short, put_i16, read_i16),
        fixed!(UShort, put_u16, read_u16),
        fixed!(Int, put_i32, read_i32),
        fixed!(UInt, put_u32, read_u32),
        fixed!(Long, put_i64, read_i64),
        fixed!(ULong, put_u64, read_u64),
        fixed!(Float, put_f32, read_f32),
        fixed!(Double, put_f64, read_f64),
        fixed!(QChar, put_u16, read_u16),
        serializer!(
            TypeTag::Qt(QtType::QString), QString,
            |v, buf, _r, _f| write_utf16(buf, v.as_deref()),
            |buf, _r, _f| read_utf16(buf)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QStringList), QStringList,
            |v, buf, _r, _f| {
                write_count(buf, v.len())?;
                v.iter().try_for_each(|s| write_utf16(buf, s.as_deref()))
            },
            |buf, _r, _f| {
                let count = read_count(buf)?;
                (0..count).map(|_| read_utf16(buf)).collect::<Result<Vec<_>>>()?
            },
        ),
        serializer!(
            TypeTag::Qt(QtType::QByteArray), QByteArray,
            |v, buf, _r, _f| write_bytes(buf, v.as_deref()),
            |buf, _r, _f| read_bytes(buf)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QDate), QDate,
            |v, buf, _r, _f| write_date(buf, *v),
            |buf, _r, _f| read_date(buf)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QTime), QTime,
            |v, buf, _r, _f| { write_time(buf, *v); Ok(()) },
            |buf, _r, _f| read_time(buf)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QDateTime), QDateTime,
            |v, buf, _r, _f| write_datetime(buf, v),
            |buf, _r, _f| read_datetime(buf)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QUuid), QUuid,
            |v, buf, _r, _f| {
                let (high, low) = v.as_u64_pair();
                buf.put_u64(high);
                buf.put_u64(low);
                Ok(())
            },
            |buf, _r, _f| {
                let high = read_u64(buf)?;
                let low = read_u64(buf)?;
                Uuid::from_u64_pair(high, low)
            },
        ),
        serializer!(
            TypeTag::Qt(QtType::QVariantList), QVariantList,
            |v, buf, reg, f| reg.serialize_list(buf, v, f),
            |buf, reg, f, depth| reg.deserialize_list_nested(buf, f, depth + 1)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QVariantMap), QVariantMap,
            |v, buf, reg, f| reg.serialize_map(buf, v, f),
            |buf, reg, f, depth| reg.deserialize_map_nested(buf, f, depth + 1)?,
        ),
        serializer!(
            TypeTag::Qt(QtType::QVariant), QVariant,
            |v, buf, reg, f| reg.serialize(buf, v, f),
            |buf, reg, f, depth| Box::new(reg.deserialize_nested(buf, f, depth + 1)?),
        ),
    ]
}

fn quassel_serializers() -> Vec<Serializer> {
    vec![
        int_id!(BufferId, BufferId),
        int_id!(NetworkId, NetworkId),
        int_id!(IdentityId, IdentityId),
        serializer!(
            TypeTag::Quassel(QuasselType::MsgId), MsgId,
            |v, buf, _r, f| { write_msg_id(buf, *v, f); Ok(()) },
            |buf, _r, f| read_msg_id(buf, f)?,
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::BufferInfo), BufferInfo,
            |v, buf, _r, _f| write_buffer_info(buf, v),
            |buf, _r, _f| read_buffer_info(buf)?,
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::Message), Message,
            |v, buf, _r, f| write_message(buf, v, f),
            |buf, _r, f| Box::new(read_message(buf, f)?),
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::QHostAddress), QHostAddress,
            |v, buf, _r, _f| { write_host_address(buf, v); Ok(()) },
            |buf, _r, _f| read_host_address(buf)?,
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::PeerPtr), PeerPtr,
            |v, buf, _r, _f| { buf.put_u64(*v); Ok(()) },
            |buf, _r, _f| read_u64(buf)?,
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::DccIpDetectionMode), DccIpDetectionMode,
            |v, buf, _r, _f| { buf.put_u8(*v); Ok(()) },
            |buf, _r, _f| read_u8(buf)?,
        ),
        serializer!(
            TypeTag::Quassel(QuasselType::DccPortSelectionMode), DccPortSelectionMode,
            |v, buf, _r, _f| { buf.put_u8(*v); Ok(()) },
            |buf, _r, _f| read_u8(buf)?,
        ),
        map_shaped!(IrcUser),
        map_shaped!(IrcChannel),
        map_shaped!(Identity),
        map_shaped!(NetworkInfo),
        map_shaped!(NetworkServer),
    ]
}

fn write_msg_id(buf: &mut BytesMut, id: MsgId, features: &FeatureSet) {
    if features.has_feature(QuasselFeature::LongMessageId) {
        buf.put_i64(id.0);
    } else {
        buf.put_i32(id.0 as i32);
    }
}

fn read_msg_id(buf: &mut Bytes, features: &FeatureSet) -> Result<MsgId> {
    if features.has_feature(QuasselFeature::LongMessageId) {
        Ok(MsgId(read_i64(buf)?))
    } else {
        Ok(MsgId(i64::from(read_i32(buf)?)))
    }
}

pub(crate) fn write_buffer_info(buf: &mut BytesMut, info: &BufferInfo) -> Result<()> {
    buf.put_i32(info.buffer_id.0);
    buf.put_i32(info.network_id.0);
    buf.put_u16(info.buffer_type.bits());
    buf.put_i32(info.group_id);
    write_utf8(buf, info.buffer_name.as_deref())
}

pub(crate) fn read_buffer_info(buf: &mut Bytes) -> Result<BufferInfo> {
    Ok(BufferInfo {
        buffer_id: BufferId(read_i32(buf)?),
        network_id: NetworkId(read_i32(buf)?),
        buffer_type: BufferType::from_bits_truncate(read_u16(buf)?),
        group_id: read_i32(buf)?,
        buffer_name: read_utf8(buf)?,
    })
}

fn write_message(buf: &mut BytesMut, message: &Message, features: &FeatureSet) -> Result<()> {
    write_msg_id(buf, message.message_id, features);
    if features.has_feature(QuasselFeature::LongTime) {
        buf.put_i64(message.time.timestamp_millis());
    } else {
        let seconds = i32::try_from(message.time.timestamp()).map_err(|_| {
            ProtocolError::MalformedValue(constants::ERR_TIMESTAMP_RANGE.into())
        })?;
        buf.put_i32(seconds);
    }
    buf.put_u32(message.message_type.bits());
    buf.put_u8(message.flag.bits());
    write_buffer_info(buf, &message.buffer_info)?;
    write_utf8(buf, Some(&message.sender))?;
    if features.has_feature(QuasselFeature::SenderPrefixes) {
        write_utf8(buf, Some(&message.sender_prefixes))?;
    }
    if features.has_feature(QuasselFeature::RichMessages) {
        write_utf8(buf, Some(&message.real_name))?;
        write_utf8(buf, Some(&message.avatar_url))?;
    }
    write_utf8(buf, Some(&message.content))
}

fn read_message(buf: &mut Bytes, features: &FeatureSet) -> Result<Message> {
    let message_id = read_msg_id(buf, features)?;
    let time = if features.has_feature(QuasselFeature::LongTime) {
        let millis = read_i64(buf)?;
        chrono::DateTime::from_timestamp_millis(millis)
    } else {
        let seconds = read_i32(buf)?;
        chrono::DateTime::from_timestamp(i64::from(seconds), 0)
    }
    .ok_or_else(|| ProtocolError::MalformedValue(constants::ERR_TIMESTAMP_RANGE.into()))?;
    let message_type = MessageType::from_bits_truncate(read_u32(buf)?);
    let flag = MessageFlag::from_bits_truncate(read_u8(buf)?);
    let buffer_info = read_buffer_info(buf)?;
    let sender = read_utf8(buf)?.unwrap_or_default();
    let sender_prefixes = if features.has_feature(QuasselFeature::SenderPrefixes) {
        read_utf8(buf)?.unwrap_or_default()
    } else {
        String::new()
    };
    let (real_name, avatar_url) = if features.has_feature(QuasselFeature::RichMessages) {
        (
            read_utf8(buf)?.unwrap_or_default(),
            read_utf8(buf)?.unwrap_or_default(),
        )
    } else {
        (String::new(), String::new())
    };
    let content = read_utf8(buf)?.unwrap_or_default();
    Ok(Message {
        message_id,
        time,
        message_type,
        flag,
        buffer_info,
        sender,
        sender_prefixes,
        real_name,
        avatar_url,
        content,
    })
}

fn write_host_address(buf: &mut BytesMut, address: &IpAddr) {
    match address {
        IpAddr::V4(v4) => {
            buf.put_u8(NetworkLayerProtocol::IPv4 as u8);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(NetworkLayerProtocol::IPv6 as u8);
            buf.put_slice(&v6.octets());
        }
    }
}

fn read_host_address(buf: &mut Bytes) -> Result<IpAddr> {
    let protocol = read_u8(buf)?;
    match NetworkLayerProtocol::from_byte(protocol) {
        NetworkLayerProtocol::IPv4 => {
            ensure(buf, 4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf.split_to(4));
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        NetworkLayerProtocol::IPv6 => {
            ensure(buf, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf.split_to(16));
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(ProtocolError::MalformedValue(format!(
            "unsupported network layer protocol {protocol}"
        ))),
    }
}
