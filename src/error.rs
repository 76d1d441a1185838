//! # Error Types
//!
//! Error handling for every layer of the Quassel protocol client.
//!
//! ## Error Categories
//! - **Codec Errors**: unknown wire type ids, unknown user type names, truncated or
//!   malformed payloads. Always fatal to the frame being decoded.
//! - **Handshake Errors**: `InitError`, `LoginError`, `SetupError`, carrying the text
//!   the core sent back. Returned to the caller of the handshake step.
//! - **Dispatch Errors**: `InvokerNotFound`, `UnknownMethod`, `WrongObjectType`,
//!   `SyncableNotFound`. Logged and contained to the offending message.
//! - **Transport Errors**: stream closure, TLS failures, oversized frames. These end
//!   the connection.
//!
//! ## Example Usage
//! ```rust
//! use quassel_protocol::error::{ProtocolError, Result};
//!
//! fn check_frame(len: usize) -> Result<()> {
//!     if len > 64 * 1024 * 1024 {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_frame(16).is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Repository and invoker locks
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_REPOSITORY_LOCK: &str = "Failed to acquire object repository lock";
    pub const ERR_INVOKER_LOCK: &str = "Failed to acquire invoker registry lock";

    /// Handshake fallbacks when the core sends no explanation
    pub const ERR_UNKNOWN: &str = "Unknown Error";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Transport layering errors
    pub const ERR_TLS_ALREADY_ENABLED: &str = "TLS is already enabled on this stream";
    pub const ERR_TLS_AFTER_COMPRESSION: &str = "TLS must be enabled before compression";
    pub const ERR_COMPRESSION_ALREADY_ENABLED: &str = "Compression is already enabled on this stream";

    /// Codec errors
    pub const ERR_NULL_TYPE_NAME: &str = "User type name must not be null";
    pub const ERR_ODD_HANDSHAKE_LIST: &str = "Handshake list has a key without a value";
    pub const ERR_MISSING_MSG_TYPE: &str = "Handshake message has no MsgType";
    pub const ERR_EMPTY_SIGNAL_PROXY: &str = "Signal proxy message is empty";
    pub const ERR_NESTING_TOO_DEEP: &str = "Value nesting exceeds the depth limit";
    pub const ERR_TIMESTAMP_RANGE: &str = "Message timestamp out of range";
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    // Codec
    #[error("No serializer registered for wire type id {0}")]
    UnknownWireType(i32),

    #[error("No serializer registered for user type '{0}'")]
    UnknownCustomType(String),

    #[error("Truncated buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Malformed value: {0}")]
    MalformedValue(String),

    #[error("Value of type {actual} cannot be serialized as {expected}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Parameter {index} of '{method}' has the wrong type")]
    WrongParameterType { method: String, index: usize },

    // Handshake
    #[error("Core rejected client init: {0}")]
    InitError(String),

    #[error("Core rejected login: {0}")]
    LoginError(String),

    #[error("Core rejected setup: {0}")]
    SetupError(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    // Dispatch
    #[error("No invoker registered for class '{0}'")]
    InvokerNotFound(String),

    #[error("Unknown method '{method}' on class '{class_name}'")]
    UnknownMethod { class_name: String, method: String },

    #[error("Invoker for '{0}' cannot be applied to this object")]
    WrongObjectType(String),

    #[error("No synchronized object {class_name}:{object_name}")]
    SyncableNotFound {
        class_name: String,
        object_name: String,
    },

    // Session requests
    #[error("Core failed to list channels: {0}")]
    ChannelListError(String),

    // Transport
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Compression failed: {0}")]
    CompressionFailure(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailure(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lock error: {0}")]
    LockPoisoned(String),
}

impl ProtocolError {
    /// Errors raised while routing one inbound Sync/Rpc message.
    ///
    /// These are contained to the message: the read loop logs and continues.
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvokerNotFound(_)
                | ProtocolError::UnknownMethod { .. }
                | ProtocolError::WrongObjectType(_)
                | ProtocolError::SyncableNotFound { .. }
                | ProtocolError::WrongParameterType { .. }
        )
    }

    /// Errors produced by the handshake state machine on a core rejection.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InitError(_) | ProtocolError::LoginError(_) | ProtocolError::SetupError(_)
        )
    }

    pub(crate) fn truncated(needed: usize, remaining: usize) -> Self {
        ProtocolError::Truncated { needed, remaining }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
