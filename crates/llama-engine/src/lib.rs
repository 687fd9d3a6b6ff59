//! # llama-engine
//!
//! The "narrow waist" between generation sessions and whatever actually runs
//! the forward pass. Sessions depend on the [`InferenceEngine`] and
//! [`LoadedModel`] traits only, so CPU/Metal/FFI backends can be swapped
//! without touching session code.
//!
//! ## Design Notes
//!
//! ### Interior Mutability
//! Every method takes `&self`. A loaded model is shared read-only by many
//! sessions; backends that keep mutable state (scratch buffers, queues) guard
//! it themselves.
//!
//! ### Priming
//! [`LoadedModel::prime`] prefills the given tokens into the session's cache
//! and returns a [`DecodeCursor`]. The cursor is lazy and single-use: each
//! pulled item runs one forward step, samples one token, and writes that
//! token's position into the cache before it is yielded. When `prime`
//! returns, the cache holds every fed token.
//!
//! ### Token Type
//! `TokenId` is `i32` for C compatibility, though ids are logically
//! non-negative.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

pub use llama_kv::{KvCache, SessionKVCache, SharedCache};
pub use llama_sampling::{RepetitionPenalty, Sampler, SamplingConfig};
pub use llama_tokenizer::Tokenizer;

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Top-level error type for all engine operations. Messages are carried
/// verbatim from the backend.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Model loading cancelled")]
    Cancelled,
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Cache error: {0}")]
    Cache(String),
}

impl From<llama_kv::KVError> for LlamaError {
    fn from(e: llama_kv::KVError) -> Self {
        LlamaError::Cache(e.to_string())
    }
}

impl From<llama_sampling::SamplingError> for LlamaError {
    fn from(e: llama_sampling::SamplingError) -> Self {
        LlamaError::Inference(e.to_string())
    }
}

impl From<llama_tokenizer::TokenizerError> for LlamaError {
    fn from(e: llama_tokenizer::TokenizerError) -> Self {
        LlamaError::Tokenization(e.to_string())
    }
}

/// Specification for loading a model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Model directory (weights, config.json, tokenizer.json).
    pub path: PathBuf,
    /// Upper bound on the backend's buffer cache, in bytes.
    pub cache_limit_bytes: usize,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_limit_bytes: 32 * 1024 * 1024,
        }
    }

    pub fn with_cache_limit(mut self, bytes: usize) -> Self {
        self.cache_limit_bytes = bytes;
        self
    }
}

/// Static facts about a loaded model that sessions need.
#[derive(Debug, Clone, Default)]
pub struct ModelConfiguration {
    /// End-of-generation ids declared by the model config.
    pub eos_token_ids: HashSet<TokenId>,
    /// Extra stop strings declared by the model, resolved through the tokenizer.
    pub extra_eos_tokens: Vec<String>,
}

/// Parameters for allocating a fresh per-session cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheParameters {
    /// Maximum KV window. `None` uses the model default.
    pub max_kv_size: Option<usize>,
}

/// One priming call: feed `tokens` into `cache` and start sampling.
pub struct PrimeRequest {
    pub tokens: Vec<TokenId>,
    pub cache: SharedCache,
    pub sampler: Sampler,
    /// Already seeded with the whole input sequence, not just `tokens`.
    /// Backends apply it before sampling and report each sampled token.
    pub processor: Option<RepetitionPenalty>,
    /// Maximum tokens per prefill chunk.
    pub prefill_step_size: usize,
}

impl std::fmt::Debug for PrimeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimeRequest")
            .field("tokens", &self.tokens)
            .field("sampler", self.sampler.config())
            .field("processor", &self.processor.is_some())
            .field("prefill_step_size", &self.prefill_step_size)
            .finish()
    }
}

/// Lazy, single-use token stream produced by [`LoadedModel::prime`].
///
/// `None` means the backend has nothing more to produce (length limit,
/// cache full). Errors are terminal.
pub type DecodeCursor = Box<dyn Iterator<Item = Result<TokenId>> + Send>;

/// Loads models from disk.
pub trait InferenceEngine: Send + Sync {
    /// Load the model at `spec.path`. `progress` receives a fraction in
    /// `[0, 1]`; returning `false` asks the backend to stop early.
    fn load_model(
        &self,
        spec: &ModelSpec,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Arc<dyn LoadedModel>>;
}

/// A model resident in memory, shared read-only across sessions.
pub trait LoadedModel: Send + Sync {
    fn configuration(&self) -> &ModelConfiguration;

    /// The model's tokenizer. May be expensive; callers cache it.
    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>>;

    /// Allocate an empty cache with one layer per transformer block.
    fn new_cache(&self, params: &CacheParameters) -> Result<SessionKVCache>;

    /// Prefill `request.tokens` and return the decode cursor.
    fn prime(&self, request: PrimeRequest) -> Result<DecodeCursor>;
}
