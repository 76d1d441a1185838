//! # Client Service Layer
//!
//! Connection lifecycle on top of the protocol messages.
//!
//! ## Components
//! - **Channel**: reader and writer tasks plus the handler chain
//! - **Magic**: negotiation before framing starts
//! - **Handshake**: init, setup, login and `SessionInit`
//! - **Session**: signal proxy routing over the object repository
//! - **RPC**: core-to-client calls surfaced as events
//! - **Backlog**: awaitable backlog requests
//! - **IRC list**: awaitable channel listings per network
//! - **Client**: [`QuasselClient`](client::QuasselClient), everything wired up

pub mod backlog;
pub mod channel;
pub mod client;
pub mod handshake;
pub mod irc_list;
pub mod magic;
pub mod proxy;
pub mod rpc;
pub mod session;
