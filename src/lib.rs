//! # llama-ffi
//!
//! Handle-based C ABI for incremental, cache-aware text generation.
//!
//! Supports:
//! - Model and session handles safe to share across foreign threads and isolates
//! - Prefix reuse: a new generation only prefills what the cache does not already hold
//! - Cache trimming from either end (undo, sliding window)
//! - Greedy / top-k / min-p / top-p / temperature sampling with repetition penalty
//! - Byte-level and byte-fallback token decoding (raw bytes out, caller reassembles UTF-8)
//! - Per-thread error messages
//!
//! The inference engine itself is pluggable: a backend implements
//! [`llama_engine::InferenceEngine`] and calls [`install`] before the host
//! calls `llama_ffi_init`.

pub mod config;
pub mod error;
pub mod error_state;
pub mod ffi;
pub mod logging;
pub mod model;
pub mod runtime;
pub mod session;

pub use config::RuntimeConfig;
pub use error::{FfiError, Result};
pub use model::Model;
pub use runtime::{install, NextOutput, ProgressFn, Runtime, TokenizeOutput};
pub use session::{NextToken, PrimeReport, Session, SessionServices, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
