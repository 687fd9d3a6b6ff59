//! # llama-tokenizer
//!
//! Tokenizer contract and vocabulary byte decoding for llama.rs.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends (the engine owns
//!   the real vocabulary; sessions only consume it through this trait)
//! - [`ByteDecoding`] detection from a model's `tokenizer.json`
//! - [`token_bytes`], which turns a vocabulary string back into the raw bytes
//!   it stands for so that callers can do their own UTF-8 reassembly

mod decoding;

pub use decoding::{byte_level_char, detect_byte_decoding, token_bytes, ByteDecoding, METASPACE};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Tokenizer unavailable: {0}")]
    Unavailable(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
///
/// Token IDs are `i32` for FFI compatibility.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    fn encode(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<i32>>;

    /// Raw vocabulary string for a token ID, before any byte decoding.
    fn id_to_token(&self, token: i32) -> Option<String>;

    /// Reverse lookup of a vocabulary string.
    fn token_to_id(&self, token: &str) -> Option<i32>;

    /// The tokenizer's own end-of-sequence token, if it declares one.
    fn eos_token_id(&self) -> Option<i32>;
}
