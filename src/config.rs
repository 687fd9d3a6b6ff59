//! Runtime configuration.
//!
//! Read once at install time from the JSON file named by `LLAMA_FFI_CONFIG`,
//! falling back to defaults when the variable is unset.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "LLAMA_FFI_CONFIG";

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "LLAMA_FFI_LOG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    /// `tracing` filter directive used when `LLAMA_FFI_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Maximum tokens per prefill chunk, forwarded on every prime.
    #[serde(default = "default_prefill_step_size")]
    pub prefill_step_size: usize,

    /// Backend buffer-cache ceiling, forwarded at model load.
    #[serde(default = "default_cache_limit_bytes")]
    pub cache_limit_bytes: usize,

    /// Extra stop strings added to every generation's stop set.
    #[serde(default)]
    pub extra_eos_tokens: Vec<String>,
}

fn default_log_filter() -> String {
    "warn".to_string()
}
fn default_prefill_step_size() -> usize {
    4096
}
fn default_cache_limit_bytes() -> usize {
    32 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            log_filter: default_log_filter(),
            prefill_step_size: default_prefill_step_size(),
            cache_limit_bytes: default_cache_limit_bytes(),
            extra_eos_tokens: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load from `LLAMA_FFI_CONFIG` if set, else defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}
