//! # quassel-protocol
//!
//! Client side of the Quassel core protocol.
//!
//! ## Layers
//! - [`core`]: the `QVariant` value model, its serializers and frame codec
//! - [`transport`]: TLS and compression stacked on the raw stream
//! - [`protocol`]: negotiation, handshake and signal proxy messages plus the
//!   synchronized object model
//! - [`service`]: a running connection and the [`QuasselClient`] facade
//! - [`config`], [`error`] and [`utils`]: the supporting pieces

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::QuasselConfig;
pub use crate::core::features::{FeatureSet, QuasselFeature};
pub use crate::core::variant::{QVariant, QVariantList, QVariantMap};
pub use crate::error::{ProtocolError, Result};
pub use crate::service::client::QuasselClient;
pub use crate::service::rpc::SessionEvent;
