//! Wire type enumerations.
//!
//! `QtType` ids and `QuasselType` names must stay bit-compatible with deployed
//! cores, never renumber them.

use std::fmt;

/// Primitive wire types with their fixed numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum QtType {
    Void = 0,
    Bool = 1,
    Int = 2,
    UInt = 3,
    Double = 6,
    QChar = 7,
    QVariantMap = 8,
    QVariantList = 9,
    QString = 10,
    QStringList = 11,
    QByteArray = 12,
    QDate = 14,
    QTime = 15,
    QDateTime = 16,
    QUuid = 30,
    UserType = 127,
    Long = 129,
    Short = 130,
    Char = 131,
    ULong = 132,
    UShort = 133,
    UChar = 134,
    Float = 135,
    QVariant = 138,
}

impl QtType {
    pub const ALL: [QtType; 24] = [
        QtType::Void,
        QtType::Bool,
        QtType::Int,
        QtType::UInt,
        QtType::Double,
        QtType::QChar,
        QtType::QVariantMap,
        QtType::QVariantList,
        QtType::QString,
        QtType::QStringList,
        QtType::QByteArray,
        QtType::QDate,
        QtType::QTime,
        QtType::QDateTime,
        QtType::QUuid,
        QtType::UserType,
        QtType::Long,
        QtType::Short,
        QtType::Char,
        QtType::ULong,
        QtType::UShort,
        QtType::UChar,
        QtType::Float,
        QtType::QVariant,
    ];

    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.id() == id)
    }

    /// Qt's own name for the type, used in RPC slot signatures.
    pub fn name(self) -> &'static str {
        match self {
            QtType::Void => "void",
            QtType::Bool => "bool",
            QtType::Int => "int",
            QtType::UInt => "uint",
            QtType::Double => "double",
            QtType::QChar => "QChar",
            QtType::QVariantMap => "QVariantMap",
            QtType::QVariantList => "QVariantList",
            QtType::QString => "QString",
            QtType::QStringList => "QStringList",
            QtType::QByteArray => "QByteArray",
            QtType::QDate => "QDate",
            QtType::QTime => "QTime",
            QtType::QDateTime => "QDateTime",
            QtType::QUuid => "QUuid",
            QtType::UserType => "UserType",
            QtType::Long => "qlonglong",
            QtType::Short => "short",
            QtType::Char => "char",
            QtType::ULong => "qulonglong",
            QtType::UShort => "ushort",
            QtType::UChar => "uchar",
            QtType::Float => "float",
            QtType::QVariant => "QVariant",
        }
    }
}

impl fmt::Display for QtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named Quassel types carried behind the [`QtType::UserType`] marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuasselType {
    BufferId,
    BufferInfo,
    DccIpDetectionMode,
    DccPortSelectionMode,
    IrcUser,
    IrcChannel,
    Identity,
    IdentityId,
    Message,
    MsgId,
    NetworkId,
    NetworkInfo,
    NetworkServer,
    QHostAddress,
    PeerPtr,
}

impl QuasselType {
    pub const ALL: [QuasselType; 15] = [
        QuasselType::BufferId,
        QuasselType::BufferInfo,
        QuasselType::DccIpDetectionMode,
        QuasselType::DccPortSelectionMode,
        QuasselType::IrcUser,
        QuasselType::IrcChannel,
        QuasselType::Identity,
        QuasselType::IdentityId,
        QuasselType::Message,
        QuasselType::MsgId,
        QuasselType::NetworkId,
        QuasselType::NetworkInfo,
        QuasselType::NetworkServer,
        QuasselType::QHostAddress,
        QuasselType::PeerPtr,
    ];

    /// Name written on the wire after the UserType marker.
    pub fn type_name(self) -> &'static str {
        match self {
            QuasselType::BufferId => "BufferId",
            QuasselType::BufferInfo => "BufferInfo",
            QuasselType::DccIpDetectionMode => "DccConfig::IpDetectionMode",
            QuasselType::DccPortSelectionMode => "DccConfig::PortSelectionMode",
            QuasselType::IrcUser => "IrcUser",
            QuasselType::IrcChannel => "IrcChannel",
            QuasselType::Identity => "Identity",
            QuasselType::IdentityId => "IdentityId",
            QuasselType::Message => "Message",
            QuasselType::MsgId => "MsgId",
            QuasselType::NetworkId => "NetworkId",
            QuasselType::NetworkInfo => "NetworkInfo",
            QuasselType::NetworkServer => "Network::Server",
            QuasselType::QHostAddress => "QHostAddress",
            QuasselType::PeerPtr => "PeerPtr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.type_name() == name)
    }

    /// Every Quassel type travels as a Qt UserType.
    pub fn qt_type(self) -> QtType {
        QtType::UserType
    }
}

impl fmt::Display for QuasselType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Either kind of tag a [`QVariant`](crate::core::variant::QVariant) can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Qt(QtType),
    Quassel(QuasselType),
}

impl TypeTag {
    pub fn qt_type(self) -> QtType {
        match self {
            TypeTag::Qt(t) => t,
            TypeTag::Quassel(t) => t.qt_type(),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Qt(t) => t.fmt(f),
            TypeTag::Quassel(t) => t.fmt(f),
        }
    }
}
