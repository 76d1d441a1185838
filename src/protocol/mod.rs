//! # Protocol Messages and Object Model
//!
//! ## Phases
//! 1. **Negotiation**: raw magic exchange choosing TLS, compression and the
//!    protocol version ([`negotiation`])
//! 2. **Handshake**: key/value messages up to `SessionInit` ([`handshake`])
//! 3. **Signal proxy**: object sync, RPC, init and heartbeat traffic
//!    ([`signal_proxy`])
//!
//! The object model behind phase 3 lives in [`syncable`], [`repository`] and
//! [`dispatcher`].

pub mod dispatcher;
pub mod handshake;
pub mod negotiation;
pub mod repository;
pub mod signal_proxy;
pub mod syncable;
