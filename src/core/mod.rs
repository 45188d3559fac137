//! # Core Protocol Components
//!
//! Low-level framing and the self-describing message format.
//!
//! ## Components
//! - **Codec**: Tokio codec for frame reassembly over byte streams
//! - **Message**: Typed value tree with a text wire encoding
//!
//! ## Wire Format
//! ```text
//! [Flags(1)] [Length(3)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB (24-bit length)
//! - Length validation before allocation
//! - Bounded nesting depth when decoding messages

pub mod codec;
pub mod message;
