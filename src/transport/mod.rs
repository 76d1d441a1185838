//! # Transport Layer
//!
//! The byte stream between client and core, below framing.
//!
//! ## Layers
//! - **Plain**: the TCP connection (or any `AsyncRead + AsyncWrite`)
//! - **TLS**: rustls, negotiated in-band after the magic exchange
//! - **Compression**: one zlib stream per direction, sync-flushed per frame
//!
//! Layers are enabled in that order and never removed.

pub mod compression;
pub mod stream;
pub mod tls;

pub use stream::LayeredStream;
