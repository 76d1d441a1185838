//! # Utility Modules
//!
//! Supporting pieces shared by the transport, protocol and service layers.
//!
//! ## Components
//! - **Keyed Queue**: rendezvous between a request and its keyed reply
//! - **Heartbeat**: latency tracking from heartbeat replies
//! - **Init Tracker**: objects still waiting for their initial state
//! - **Logging**: tracing subscriber setup
//! - **Metrics**: per-connection atomic counters
//! - **Timeout**: async timeout wrappers

pub mod heartbeat;
pub mod init_tracker;
pub mod keyed_queue;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use keyed_queue::KeyedQueue;
