//! # Core Protocol Components
//!
//! The typed value model and its binary encoding.
//!
//! ## Components
//! - **Types**: numeric Qt type ids and named Quassel user types
//! - **Variant**: the self-describing [`QVariant`](variant::QVariant) value
//! - **Serializer**: registry mapping each type to its payload layout
//! - **Codec**: tokio codec cutting the byte stream into frames
//!
//! ## Wire Format
//! ```text
//! Frame:  [Length u32] [QVariantList payload]
//! Value:  [TypeId i32] [IsNull u8] ([TypeName]) [Payload]
//! ```
//!
//! All integers are big-endian. Length fields are validated before anything
//! is allocated.

pub mod codec;
pub mod features;
pub mod models;
pub mod primitive;
pub mod serializer;
pub mod types;
pub mod variant;
