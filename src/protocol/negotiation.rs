//! # Connection Negotiation
//!
//! The raw exchange that happens before any framing.
//!
//! ## Client Header
//! ```text
//! [Magic | Features u32]  then per offered protocol:
//! [Marker u8 (0x80 on the last entry)] [Data u16] [Version u8]
//! ```
//!
//! ## Core Reply
//! ```text
//! [Features u8] [Data u16] [Version u8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;

use crate::error::{ProtocolError, Result};

pub const MAGIC: u32 = 0x42b3_3f00;
const LAST_PROTOCOL: u8 = 0x80;

/// Optional stream layers a peer can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProtocolFeatures(u8);

impl ProtocolFeatures {
    pub const TLS: ProtocolFeatures = ProtocolFeatures(0x01);
    pub const COMPRESSION: ProtocolFeatures = ProtocolFeatures(0x02);

    pub const fn empty() -> Self {
        ProtocolFeatures(0)
    }

    pub const fn all() -> Self {
        ProtocolFeatures(0x03)
    }

    pub fn from_bits_truncate(bits: u8) -> Self {
        ProtocolFeatures(bits & Self::all().0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProtocolFeatures {
    type Output = ProtocolFeatures;

    fn bitor(self, rhs: Self) -> Self {
        ProtocolFeatures(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    Legacy = 1,
    Datastream = 2,
}

impl ProtocolVersion {
    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ProtocolVersion::Legacy),
            2 => Ok(ProtocolVersion::Datastream),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Legacy => f.write_str("legacy"),
            ProtocolVersion::Datastream => f.write_str("datastream"),
        }
    }
}

/// One protocol entry: version plus its 16 bits of version-specific data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMeta {
    pub version: ProtocolVersion,
    pub data: u16,
}

impl ProtocolMeta {
    pub fn datastream() -> Self {
        Self {
            version: ProtocolVersion::Datastream,
            data: 0,
        }
    }
}

/// What the client sends first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHeader {
    pub features: ProtocolFeatures,
    pub protocols: Vec<ProtocolMeta>,
}

impl ClientHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.protocols.len() * 4);
        buf.put_u32(MAGIC | u32::from(self.features.bits()));
        let last = self.protocols.len().saturating_sub(1);
        for (index, meta) in self.protocols.iter().enumerate() {
            buf.put_u8(if index == last { LAST_PROTOCOL } else { 0x00 });
            buf.put_u16(meta.data);
            buf.put_u8(meta.version as u8);
        }
    }

    /// Core side parse, used to act as a peer in tests and tools.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::truncated(4, buf.remaining()));
        }
        let word = buf.get_u32();
        if word & 0xffff_ff00 != MAGIC {
            return Err(ProtocolError::MalformedValue(format!(
                "bad magic 0x{word:08x}"
            )));
        }
        let features = ProtocolFeatures::from_bits_truncate(word as u8);
        let mut protocols = Vec::new();
        loop {
            if buf.remaining() < 4 {
                return Err(ProtocolError::truncated(4, buf.remaining()));
            }
            let marker = buf.get_u8();
            let data = buf.get_u16();
            let version = ProtocolVersion::from_byte(buf.get_u8())?;
            protocols.push(ProtocolMeta { version, data });
            if marker & LAST_PROTOCOL != 0 {
                break;
            }
        }
        Ok(Self {
            features,
            protocols,
        })
    }
}

/// The core's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreHeader {
    pub features: ProtocolFeatures,
    pub meta: ProtocolMeta,
}

impl CoreHeader {
    pub const LEN: usize = 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.features.bits());
        buf.put_u16(self.meta.data);
        buf.put_u8(self.meta.version as u8);
    }

    pub fn decode(raw: [u8; Self::LEN]) -> Result<Self> {
        Ok(Self {
            features: ProtocolFeatures::from_bits_truncate(raw[0]),
            meta: ProtocolMeta {
                data: u16::from_be_bytes([raw[1], raw[2]]),
                version: ProtocolVersion::from_byte(raw[3])?,
            },
        })
    }
}
