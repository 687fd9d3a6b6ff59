//! Loaded-model handle.
//!
//! A [`Model`] wraps the engine's loaded model together with its byte
//! decoding scheme and a process-stable identity. It is shared read-only by
//! every session created from it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use llama_engine::{LoadedModel, TokenId};
use llama_tokenizer::{token_bytes, ByteDecoding, Tokenizer};
use once_cell::sync::OnceCell;

use crate::error::Result;

pub struct Model {
    id: i64,
    inner: Arc<dyn LoadedModel>,
    decoding: ByteDecoding,
    tokenizer: OnceCell<Arc<dyn Tokenizer>>,
}

impl Model {
    pub fn new(id: i64, inner: Arc<dyn LoadedModel>, decoding: ByteDecoding) -> Self {
        Self {
            id,
            inner,
            decoding,
            tokenizer: OnceCell::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn decoding(&self) -> ByteDecoding {
        self.decoding
    }

    pub fn engine_model(&self) -> &Arc<dyn LoadedModel> {
        &self.inner
    }

    /// The model's tokenizer, fetched from the engine on first use.
    ///
    /// Concurrent first calls race to initialize; exactly one result is kept.
    pub fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        let tokenizer = self.tokenizer.get_or_try_init(|| self.inner.tokenizer())?;
        Ok(tokenizer.clone())
    }

    /// End-of-generation ids: model config EOS plus the tokenizer's own EOS.
    pub fn eos_token_ids(&self) -> Result<HashSet<TokenId>> {
        let mut ids = self.inner.configuration().eos_token_ids.clone();
        ids.extend(self.tokenizer()?.eos_token_id());
        Ok(ids)
    }

    pub fn is_end_of_generation(&self, token: TokenId) -> Result<bool> {
        Ok(self.eos_token_ids()?.contains(&token))
    }

    /// Full stop set for a generation: EOS ids plus every extra stop string
    /// (model-declared and `extra`) that resolves to a vocabulary id.
    pub fn stop_token_ids(&self, extra: &[String]) -> Result<HashSet<TokenId>> {
        let tokenizer = self.tokenizer()?;
        let mut ids = self.eos_token_ids()?;
        ids.extend(
            self.inner
                .configuration()
                .extra_eos_tokens
                .iter()
                .chain(extra)
                .filter_map(|s| tokenizer.token_to_id(s)),
        );
        Ok(ids)
    }

    /// Raw bytes for one token. Ids missing from the vocabulary yield nothing.
    pub fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>> {
        Ok(self
            .tokenizer()?
            .id_to_token(token)
            .map(|s| token_bytes(&s, self.decoding))
            .unwrap_or_default())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("decoding", &self.decoding)
            .field("tokenizer_resolved", &self.tokenizer.get().is_some())
            .finish()
    }
}
