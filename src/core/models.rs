//! Quassel record types that ride inside user-typed values.

use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::BitOr;

macro_rules! signed_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl $name {
            #[inline]
            pub fn id(self) -> $inner {
                self.0
            }

            /// Quassel uses non-positive ids as "unset".
            #[inline]
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                $name(value)
            }
        }
    };
}

signed_id!(
    /// Identifier of a buffer (channel, query or status window).
    BufferId(i32)
);
signed_id!(
    /// Identifier of an IRC network configured on the core.
    NetworkId(i32)
);
signed_id!(
    /// Identifier of a user identity.
    IdentityId(i32)
);
signed_id!(
    /// Identifier of a stored message. 64-bit on the wire with `LongMessageId`.
    MsgId(i64)
);

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident($bits:ty) { $($flag:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub $bits);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn all() -> Self {
                $name(0 $(| $value)*)
            }

            #[inline]
            pub fn bits(self) -> $bits {
                self.0
            }

            /// Keep only bits with a known meaning.
            pub fn from_bits_truncate(bits: $bits) -> Self {
                $name(bits & Self::all().0)
            }

            #[inline]
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

flag_set!(
    /// Kind of a buffer.
    BufferType(u16) {
        STATUS = 0x01,
        CHANNEL = 0x02,
        QUERY = 0x04,
        GROUP = 0x08,
    }
);

flag_set!(
    /// Kind of a message, one bit per kind.
    MessageType(u32) {
        PLAIN = 0x00001,
        NOTICE = 0x00002,
        ACTION = 0x00004,
        NICK = 0x00008,
        MODE = 0x00010,
        JOIN = 0x00020,
        PART = 0x00040,
        QUIT = 0x00080,
        KICK = 0x00100,
        KILL = 0x00200,
        SERVER = 0x00400,
        INFO = 0x00800,
        ERROR = 0x01000,
        DAY_CHANGE = 0x02000,
        TOPIC = 0x04000,
        NETSPLIT_JOIN = 0x08000,
        NETSPLIT_QUIT = 0x10000,
        INVITE = 0x20000,
        MARKERLINE = 0x40000,
    }
);

flag_set!(
    /// Flags attached to a message.
    MessageFlag(u8) {
        SELF = 0x01,
        HIGHLIGHT = 0x02,
        REDIRECTED = 0x04,
        SERVER_MSG = 0x08,
        BACKLOG = 0x80,
    }
);

/// Metadata of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub buffer_id: BufferId,
    pub network_id: NetworkId,
    pub buffer_type: BufferType,
    pub group_id: i32,
    pub buffer_name: Option<String>,
}

impl Default for BufferInfo {
    fn default() -> Self {
        Self {
            buffer_id: BufferId(-1),
            network_id: NetworkId(-1),
            buffer_type: BufferType::empty(),
            group_id: -1,
            buffer_name: None,
        }
    }
}

/// A chat line as stored by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MsgId,
    pub time: DateTime<Utc>,
    pub message_type: MessageType,
    pub flag: MessageFlag,
    pub buffer_info: BufferInfo,
    /// `nick!ident@host` of the sender
    pub sender: String,
    pub sender_prefixes: String,
    pub real_name: String,
    pub avatar_url: String,
    pub content: String,
}

/// Protocol byte of a serialized host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkLayerProtocol {
    IPv4 = 0,
    IPv6 = 1,
    Any = 2,
    Unknown = 0xff,
}

impl NetworkLayerProtocol {
    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => NetworkLayerProtocol::IPv4,
            1 => NetworkLayerProtocol::IPv6,
            2 => NetworkLayerProtocol::Any,
            _ => NetworkLayerProtocol::Unknown,
        }
    }
}
