//! # Utility Modules
//!
//! Supporting utilities for payload encryption, logging and metrics.
//!
//! ## Components
//! - **Crypto**: ChaCha20-Poly1305 behind the opaque `FrameCipher` seam
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure nonces (getrandom)
//! - Authenticated encryption rejects tampered frames

pub mod crypto;
pub mod logging;
pub mod metrics;

pub use crypto::{ChaChaCipher, FrameCipher};
pub use metrics::{global_metrics, Metrics};
