//! # Boxed Values
//!
//! [`QVariant`] is the self-describing value every payload field is built from.
//! Each variant fixes its wire type, so a value always matches the serializer
//! registered for its [`TypeTag`]. Extraction goes through [`FromQVariant`] and
//! yields `None` on a type mismatch instead of guessing.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::core::models::{BufferId, BufferInfo, IdentityId, Message, MsgId, NetworkId};
use crate::core::types::{QtType, QuasselType, TypeTag};
use crate::error::{ProtocolError, Result};

pub type QVariantList = Vec<QVariant>;
pub type QVariantMap = BTreeMap<String, QVariant>;

/// How a `QDateTime` relates to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum TimeSpec {
    LocalUnknown = -1,
    LocalStandard = 0,
    LocalDst = 1,
    Utc = 2,
    OffsetFromUtc = 3,
}

impl TimeSpec {
    /// Unknown bytes decode as local time, as Qt does.
    pub fn from_byte(value: i8) -> Self {
        match value {
            0 => TimeSpec::LocalStandard,
            1 => TimeSpec::LocalDst,
            2 => TimeSpec::Utc,
            3 => TimeSpec::OffsetFromUtc,
            _ => TimeSpec::LocalUnknown,
        }
    }
}

/// A Qt date-time with its time spec preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QDateTime {
    Local {
        datetime: NaiveDateTime,
        spec: TimeSpec,
    },
    Utc(DateTime<Utc>),
    Offset(DateTime<FixedOffset>),
}

impl QDateTime {
    /// Current time at the millisecond precision the wire format carries.
    pub fn now() -> Self {
        QDateTime::Utc(Utc::now().trunc_subsecs(3))
    }

    pub fn time_spec(&self) -> TimeSpec {
        match self {
            QDateTime::Local { spec, .. } => *spec,
            QDateTime::Utc(_) => TimeSpec::Utc,
            QDateTime::Offset(_) => TimeSpec::OffsetFromUtc,
        }
    }

    /// Wall clock date and time as written on the wire.
    pub fn naive_local(&self) -> NaiveDateTime {
        match self {
            QDateTime::Local { datetime, .. } => *datetime,
            QDateTime::Utc(dt) => dt.naive_utc(),
            QDateTime::Offset(dt) => dt.naive_local(),
        }
    }

    /// The instant, if the value is anchored to UTC.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            QDateTime::Local { .. } => None,
            QDateTime::Utc(dt) => Some(*dt),
            QDateTime::Offset(dt) => Some(dt.with_timezone(&Utc)),
        }
    }
}

impl From<DateTime<Utc>> for QDateTime {
    fn from(value: DateTime<Utc>) -> Self {
        QDateTime::Utc(value)
    }
}

/// A typed value with enough information to serialize itself.
#[derive(Debug, Clone, PartialEq)]
pub enum QVariant {
    Void,
    Bool(bool),
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    /// One UTF-16 code unit
    QChar(u16),
    QString(Option<String>),
    QStringList(Vec<Option<String>>),
    QByteArray(Option<Bytes>),
    QDate(NaiveDate),
    QTime(NaiveTime),
    QDateTime(QDateTime),
    QUuid(Uuid),
    QVariantList(QVariantList),
    QVariantMap(QVariantMap),
    QVariant(Box<QVariant>),

    BufferId(BufferId),
    BufferInfo(BufferInfo),
    Message(Box<Message>),
    IdentityId(IdentityId),
    NetworkId(NetworkId),
    MsgId(MsgId),
    QHostAddress(IpAddr),
    PeerPtr(u64),
    DccIpDetectionMode(u8),
    DccPortSelectionMode(u8),
    IrcUser(QVariantMap),
    IrcChannel(QVariantMap),
    Identity(QVariantMap),
    NetworkInfo(QVariantMap),
    NetworkServer(QVariantMap),
}

impl QVariant {
    pub fn tag(&self) -> TypeTag {
        match self {
            QVariant::Void => TypeTag::Qt(QtType::Void),
            QVariant::Bool(_) => TypeTag::Qt(QtType::Bool),
            QVariant::Char(_) => TypeTag::Qt(QtType::Char),
            QVariant::UChar(_) => TypeTag::Qt(QtType::UChar),
            QVariant::Short(_) => TypeTag::Qt(QtType::Short),
            QVariant::UShort(_) => TypeTag::Qt(QtType::UShort),
            QVariant::Int(_) => TypeTag::Qt(QtType::Int),
            QVariant::UInt(_) => TypeTag::Qt(QtType::UInt),
            QVariant::Long(_) => TypeTag::Qt(QtType::Long),
            QVariant::ULong(_) => TypeTag::Qt(QtType::ULong),
            QVariant::Float(_) => TypeTag::Qt(QtType::Float),
            QVariant::Double(_) => TypeTag::Qt(QtType::Double),
            QVariant::QChar(_) => TypeTag::Qt(QtType::QChar),
            QVariant::QString(_) => TypeTag::Qt(QtType::QString),
            QVariant::QStringList(_) => TypeTag::Qt(QtType::QStringList),
            QVariant::QByteArray(_) => TypeTag::Qt(QtType::QByteArray),
            QVariant::QDate(_) => TypeTag::Qt(QtType::QDate),
            QVariant::QTime(_) => TypeTag::Qt(QtType::QTime),
            QVariant::QDateTime(_) => TypeTag::Qt(QtType::QDateTime),
            QVariant::QUuid(_) => TypeTag::Qt(QtType::QUuid),
            QVariant::QVariantList(_) => TypeTag::Qt(QtType::QVariantList),
            QVariant::QVariantMap(_) => TypeTag::Qt(QtType::QVariantMap),
            QVariant::QVariant(_) => TypeTag::Qt(QtType::QVariant),
            QVariant::BufferId(_) => TypeTag::Quassel(QuasselType::BufferId),
            QVariant::BufferInfo(_) => TypeTag::Quassel(QuasselType::BufferInfo),
            QVariant::Message(_) => TypeTag::Quassel(QuasselType::Message),
            QVariant::IdentityId(_) => TypeTag::Quassel(QuasselType::IdentityId),
            QVariant::NetworkId(_) => TypeTag::Quassel(QuasselType::NetworkId),
            QVariant::MsgId(_) => TypeTag::Quassel(QuasselType::MsgId),
            QVariant::QHostAddress(_) => TypeTag::Quassel(QuasselType::QHostAddress),
            QVariant::PeerPtr(_) => TypeTag::Quassel(QuasselType::PeerPtr),
            QVariant::DccIpDetectionMode(_) => TypeTag::Quassel(QuasselType::DccIpDetectionMode),
            QVariant::DccPortSelectionMode(_) => {
                TypeTag::Quassel(QuasselType::DccPortSelectionMode)
            }
            QVariant::IrcUser(_) => TypeTag::Quassel(QuasselType::IrcUser),
            QVariant::IrcChannel(_) => TypeTag::Quassel(QuasselType::IrcChannel),
            QVariant::Identity(_) => TypeTag::Quassel(QuasselType::Identity),
            QVariant::NetworkInfo(_) => TypeTag::Quassel(QuasselType::NetworkInfo),
            QVariant::NetworkServer(_) => TypeTag::Quassel(QuasselType::NetworkServer),
        }
    }

    /// Extract a payload of type `T`, `None` if the variant holds something else.
    #[inline]
    pub fn get<T: FromQVariant>(&self) -> Option<T> {
        T::from_qvariant(self)
    }

    /// A `QByteArray` holding the UTF-8 bytes of `value`.
    ///
    /// Class, object and slot names travel this way.
    pub fn byte_string(value: &str) -> Self {
        QVariant::QByteArray(Some(Bytes::copy_from_slice(value.as_bytes())))
    }

    /// Read a `QByteArray` back as UTF-8 text. A null array reads as empty.
    pub fn as_byte_string(&self) -> Option<String> {
        match self {
            QVariant::QByteArray(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            QVariant::QByteArray(None) => Some(String::new()),
            _ => None,
        }
    }

    pub fn string_list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QVariant::QStringList(values.into_iter().map(|s| Some(s.into())).collect())
    }

    /// Parameter `index` of a sync or RPC call, converted to `T`.
    ///
    /// A missing parameter counts as the wrong type.
    pub fn expect_param<T: FromQVariant>(params: &[QVariant], index: usize, method: &str) -> Result<T> {
        params
            .get(index)
            .and_then(T::from_qvariant)
            .ok_or_else(|| ProtocolError::WrongParameterType {
                method: method.to_owned(),
                index,
            })
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            QVariant::Void | QVariant::QString(None) | QVariant::QByteArray(None)
        )
    }
}

/// Conversion out of a [`QVariant`].
pub trait FromQVariant: Sized {
    fn from_qvariant(value: &QVariant) -> Option<Self>;
}

macro_rules! copy_variant {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromQVariant for $ty {
                fn from_qvariant(value: &QVariant) -> Option<Self> {
                    match value {
                        QVariant::$variant(v) => Some(*v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for QVariant {
                fn from(value: $ty) -> Self {
                    QVariant::$variant(value)
                }
            }
        )*
    };
}

copy_variant! {
    bool => Bool,
    i8 => Char,
    u8 => UChar,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f32 => Float,
    f64 => Double,
    NaiveDate => QDate,
    NaiveTime => QTime,
    QDateTime => QDateTime,
    Uuid => QUuid,
    BufferId => BufferId,
    IdentityId => IdentityId,
    NetworkId => NetworkId,
    MsgId => MsgId,
    IpAddr => QHostAddress,
}

impl FromQVariant for QVariant {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromQVariant for Option<String> {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::QString(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A null string reads as empty.
impl FromQVariant for String {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::QString(v) => Some(v.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

impl FromQVariant for Bytes {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::QByteArray(v) => Some(v.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

impl FromQVariant for QVariantMap {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::QVariantMap(map)
            | QVariant::IrcUser(map)
            | QVariant::IrcChannel(map)
            | QVariant::Identity(map)
            | QVariant::NetworkInfo(map)
            | QVariant::NetworkServer(map) => Some(map.clone()),
            _ => None,
        }
    }
}

impl FromQVariant for BufferInfo {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::BufferInfo(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromQVariant for Message {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::Message(v) => Some((**v).clone()),
            _ => None,
        }
    }
}

/// Lists come from either a `QVariantList` or a `QStringList`.
impl<T: FromQVariant> FromQVariant for Vec<T> {
    fn from_qvariant(value: &QVariant) -> Option<Self> {
        match value {
            QVariant::QVariantList(items) => items.iter().map(T::from_qvariant).collect(),
            QVariant::QStringList(items) => items
                .iter()
                .map(|s| T::from_qvariant(&QVariant::QString(s.clone())))
                .collect(),
            _ => None,
        }
    }
}

impl From<String> for QVariant {
    fn from(value: String) -> Self {
        QVariant::QString(Some(value))
    }
}

impl From<&str> for QVariant {
    fn from(value: &str) -> Self {
        QVariant::QString(Some(value.to_owned()))
    }
}

impl From<Option<String>> for QVariant {
    fn from(value: Option<String>) -> Self {
        QVariant::QString(value)
    }
}

impl From<Bytes> for QVariant {
    fn from(value: Bytes) -> Self {
        QVariant::QByteArray(Some(value))
    }
}

impl From<QVariantList> for QVariant {
    fn from(value: QVariantList) -> Self {
        QVariant::QVariantList(value)
    }
}

impl From<QVariantMap> for QVariant {
    fn from(value: QVariantMap) -> Self {
        QVariant::QVariantMap(value)
    }
}

impl From<BufferInfo> for QVariant {
    fn from(value: BufferInfo) -> Self {
        QVariant::BufferInfo(value)
    }
}

impl From<Message> for QVariant {
    fn from(value: Message) -> Self {
        QVariant::Message(Box::new(value))
    }
}

impl From<DateTime<Utc>> for QVariant {
    fn from(value: DateTime<Utc>) -> Self {
        QVariant::QDateTime(QDateTime::Utc(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_extraction_is_none() {
        let v = QVariant::Int(5);
        assert_eq!(v.get::<i32>(), Some(5));
        assert_eq!(v.get::<u32>(), None);
        assert_eq!(v.get::<String>(), None);
    }

    #[test]
    fn null_string_reads_as_empty() {
        let v = QVariant::QString(None);
        assert_eq!(v.get::<String>(), Some(String::new()));
        assert_eq!(v.get::<Option<String>>(), Some(None));
        assert!(v.is_null());
    }

    #[test]
    fn lists_extract_element_wise() {
        let v = QVariant::QVariantList(vec![QVariant::NetworkId(NetworkId(1)), QVariant::Int(2)]);
        assert_eq!(v.get::<Vec<NetworkId>>(), None);
        let v = QVariant::QVariantList(vec![QVariant::NetworkId(NetworkId(1))]);
        assert_eq!(v.get::<Vec<NetworkId>>(), Some(vec![NetworkId(1)]));
        let v = QVariant::string_list(["a", "b"]);
        assert_eq!(v.get::<Vec<String>>(), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn expect_param_reports_index() {
        let params = vec![QVariant::from("x"), QVariant::Int(1)];
        assert_eq!(QVariant::expect_param::<i32>(&params, 1, "2setFoo").unwrap(), 1);
        match QVariant::expect_param::<i32>(&params, 0, "2setFoo") {
            Err(ProtocolError::WrongParameterType { method, index }) => {
                assert_eq!(method, "2setFoo");
                assert_eq!(index, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(QVariant::expect_param::<i32>(&params, 5, "2setFoo").is_err());
    }

    #[test]
    fn byte_strings_round_trip() {
        let v = QVariant::byte_string("Network");
        assert_eq!(v.tag(), TypeTag::Qt(QtType::QByteArray));
        assert_eq!(v.as_byte_string().as_deref(), Some("Network"));
    }

    #[test]
    fn map_shaped_user_types_extract_as_maps() {
        let mut map = QVariantMap::new();
        map.insert("nick".into(), QVariant::from("justjanne"));
        let v = QVariant::IrcUser(map.clone());
        assert_eq!(v.tag(), TypeTag::Quassel(QuasselType::IrcUser));
        assert_eq!(v.get::<QVariantMap>(), Some(map));
    }
}
