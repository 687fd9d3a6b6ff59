//! Error types for the llama-ffi crate.

use llama_engine::LlamaError;
use llama_runtime::{ExecutorError, Handle, RegistryError};
use llama_tokenizer::TokenizerError;
use thiserror::Error;

/// Top-level error type for boundary operations.
///
/// Only the message crosses the C boundary (see [`crate::error_state`]).
#[derive(Error, Debug)]
pub enum FfiError {
    #[error("Invalid model handle: {0}")]
    InvalidModel(Handle),

    #[error("Invalid session handle: {0}")]
    InvalidSession(Handle),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No active generation: call begin first")]
    NotPrimed,

    #[error("{0}")]
    Engine(#[from] LlamaError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Executor(#[from] ExecutorError),

    #[error("Runtime not installed: register an engine before calling init")]
    NotInstalled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FfiError>;
