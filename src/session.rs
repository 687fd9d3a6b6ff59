//! Generation sessions.
//!
//! A [`Session`] owns one KV cache, the token sequence that cache represents,
//! and at most one active decode cursor. Successive generations reuse the
//! longest common prefix of the cache instead of re-prefilling it.
//!
//! # States
//!
//! ```text
//!   Idle ──begin──> Primed ──next──> Decoding ──stop / exhausted──> Done
//!    ^                 │                 │                           │
//!    └─────reset───────┴─────────────────┴───────────────────────────┘
//! ```
//!
//! `begin` is valid from every state and always discards the previous cursor.
//!
//! # Invariant
//!
//! Every cache layer holds the same number of positions, and that number is
//! the length of [`Session::cached_tokens`]. A violation is a bug in this
//! crate or in the engine and panics.

use std::collections::HashSet;
use std::sync::Arc;

use llama_engine::{
    CacheParameters, DecodeCursor, PrimeRequest, RepetitionPenalty, Sampler, SamplingConfig,
    SharedCache, TokenId,
};
use llama_runtime::{Executor, GenerationTimer, TelemetryHook};

use crate::error::{FfiError, Result};
use crate::model::Model;

/// Process-wide collaborators every session needs.
pub struct SessionServices {
    /// Dedicated thread all engine calls run on.
    pub executor: Executor,
    /// Maximum tokens per prefill chunk.
    pub prefill_step_size: usize,
    /// Extra stop strings added to every stop set.
    pub extra_eos_tokens: Vec<String>,
    pub telemetry: Arc<dyn TelemetryHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No cursor, and no cache unless one survives from an earlier generation.
    Idle,
    /// Cache populated, cursor ready, nothing pulled yet.
    Primed,
    /// At least one token pulled.
    Decoding,
    /// Stop token produced or cursor exhausted. `begin` starts over.
    Done,
}

/// Result of one [`Session::next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextToken {
    /// Raw bytes of the produced token. May be an incomplete UTF-8 sequence.
    Bytes(Vec<u8>),
    /// A token was produced but decodes to no bytes.
    Empty,
    /// Generation is complete.
    Done,
}

/// What a call to [`Session::begin`] did with the existing cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeReport {
    /// Length of the common prefix between the input and the cached tokens.
    pub prefix_len: usize,
    /// Positions trimmed from the end of the cache.
    pub trimmed: usize,
    /// Tokens actually fed to the engine.
    pub fed: Vec<TokenId>,
    /// Whether a new cache was allocated.
    pub fresh_cache: bool,
}

struct Generation {
    /// `None` only while the cursor is on the executor thread.
    cursor: Option<DecodeCursor>,
    stop_tokens: HashSet<TokenId>,
    timer: GenerationTimer,
}

pub struct Session {
    model: Arc<Model>,
    services: Arc<SessionServices>,
    max_tokens: usize,
    cache: Option<SharedCache>,
    /// Tokens fed to or pulled from the engine, oldest first. The cache holds
    /// a prefix of this; positions past the cache offset are pulled tokens the
    /// engine has not written yet.
    tokens: Vec<TokenId>,
    generation: Option<Generation>,
    /// Bytes already pulled but not yet delivered to the caller.
    pending: Option<Vec<u8>>,
    state: SessionState,
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl Session {
    /// `max_tokens` bounds the KV window of caches this session allocates
    /// (0 = model default).
    pub fn new(model: Arc<Model>, max_tokens: usize, services: Arc<SessionServices>) -> Self {
        Self {
            model,
            services,
            max_tokens,
            cache: None,
            tokens: Vec::new(),
            generation: None,
            pending: None,
            state: SessionState::Idle,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Number of positions in the cache (0 without one).
    pub fn cache_token_count(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.lock().offset())
    }

    /// The token sequence the cache currently represents.
    pub fn cached_tokens(&self) -> &[TokenId] {
        let offset = self.checked_offset();
        &self.tokens[..offset]
    }

    /// Start a generation for `tokens`, reusing as much of the cache as
    /// possible, and prime the engine.
    pub fn begin(&mut self, tokens: &[TokenId], sampling: SamplingConfig) -> Result<PrimeReport> {
        if tokens.is_empty() {
            return Err(FfiError::InvalidInput("token sequence is empty".into()));
        }
        self.end_generation();
        self.pending = None;

        let cached_len = self.tokens.len();
        let prefix_len = common_prefix_len(tokens, &self.tokens);
        let mut trimmed = 0;

        let fresh_cache = prefix_len == 0 || self.cache.is_none();
        let cache = match self.cache.clone() {
            Some(cache) if !fresh_cache => {
                // Fully cached input still needs one forward step, so its last
                // position is dropped and fed again.
                let keep = prefix_len.min(tokens.len() - 1);
                let stale = cached_len - keep;
                if stale > 0 {
                    trimmed = cache.lock().trim_end(stale);
                }
                self.tokens.truncate(keep);
                cache
            }
            _ => {
                self.cache = None;
                self.tokens.clear();
                self.allocate_cache()?
            }
        };
        self.cache = Some(cache.clone());
        self.state = SessionState::Idle;
        self.check_invariant();

        let reused = self.tokens.len();
        let fed = tokens[reused..].to_vec();
        tracing::debug!(
            prefix_len,
            trimmed,
            fed = fed.len(),
            fresh_cache,
            "prefix reuse"
        );

        let mut timer = GenerationTimer::start(tokens.len(), reused, self.services.telemetry.clone());
        let stop_tokens = self.model.stop_token_ids(&self.services.extra_eos_tokens)?;

        let processor = RepetitionPenalty::from_config(&sampling).map(|mut p| {
            p.prompt(tokens);
            p
        });
        let request = PrimeRequest {
            tokens: fed.clone(),
            cache,
            sampler: Sampler::new(sampling),
            processor,
            prefill_step_size: self.services.prefill_step_size,
        };

        let engine = self.model.engine_model().clone();
        let primed = self.services.executor.run(move || engine.prime(request));
        // The engine may have written part of the suffix before failing.
        self.tokens.extend_from_slice(&fed);
        let cursor = match primed {
            Ok(Ok(cursor)) => cursor,
            Ok(Err(e)) => {
                self.sync_tokens_to_cache();
                return Err(e.into());
            }
            Err(e) => {
                self.sync_tokens_to_cache();
                return Err(e.into());
            }
        };
        timer.mark_primed();

        self.generation = Some(Generation {
            cursor: Some(cursor),
            stop_tokens,
            timer,
        });
        self.state = SessionState::Primed;
        self.check_invariant();

        Ok(PrimeReport {
            prefix_len,
            trimmed,
            fed,
            fresh_cache,
        })
    }

    /// Pull one token from the active cursor.
    pub fn next(&mut self) -> Result<NextToken> {
        if let Some(bytes) = self.pending.take() {
            return Ok(NextToken::Bytes(bytes));
        }
        match self.state {
            SessionState::Idle => return Err(FfiError::NotPrimed),
            SessionState::Done => return Ok(NextToken::Done),
            SessionState::Primed | SessionState::Decoding => {}
        }

        let mut cursor = self
            .generation
            .as_mut()
            .and_then(|g| g.cursor.take())
            .ok_or(FfiError::NotPrimed)?;
        let pulled = self.services.executor.run(move || {
            let item = cursor.next();
            (cursor, item)
        });

        let (cursor, item) = match pulled {
            Ok(pulled) => pulled,
            Err(e) => {
                self.end_generation();
                return Err(e.into());
            }
        };
        let token = match item {
            Some(Ok(token)) => token,
            None => {
                self.end_generation();
                return Ok(NextToken::Done);
            }
            Some(Err(e)) => {
                self.end_generation();
                return Err(e.into());
            }
        };

        self.tokens.push(token);
        self.check_invariant();

        let is_stop = match self.generation.as_mut() {
            Some(g) => {
                g.cursor = Some(cursor);
                g.timer.mark_token();
                g.stop_tokens.contains(&token)
            }
            None => true,
        };
        if is_stop {
            self.end_generation();
            return Ok(NextToken::Done);
        }

        self.state = SessionState::Decoding;
        let bytes = self.model.token_bytes(token)?;
        Ok(if bytes.is_empty() {
            NextToken::Empty
        } else {
            NextToken::Bytes(bytes)
        })
    }

    /// Keep `bytes` for the next [`next`](Self::next) call (the caller's
    /// buffer was too small).
    pub fn hold_back(&mut self, bytes: Vec<u8>) {
        self.pending = Some(bytes);
    }

    /// Remove the newest `n` positions. Returns how many were removed.
    pub fn trim_cache_end(&mut self, n: usize) -> usize {
        let Some(cache) = self.cache.clone() else {
            return 0;
        };
        self.end_generation();
        self.pending = None;
        let trimmed = cache.lock().trim_end(n);
        self.sync_tokens_to_cache();
        trimmed
    }

    /// Evict the oldest `n` positions. Returns how many were removed.
    pub fn trim_cache_front(&mut self, n: usize) -> usize {
        let Some(cache) = self.cache.clone() else {
            return 0;
        };
        self.end_generation();
        self.pending = None;
        let trimmed = cache.lock().trim_front(n);
        self.tokens.drain(..trimmed.min(self.tokens.len()));
        self.sync_tokens_to_cache();
        trimmed
    }

    /// Drop cache, cursor, stop set and pending bytes.
    pub fn reset(&mut self) {
        self.end_generation();
        self.cache = None;
        self.tokens.clear();
        self.pending = None;
        self.state = SessionState::Idle;
    }

    fn allocate_cache(&self) -> Result<SharedCache> {
        let params = CacheParameters {
            max_kv_size: (self.max_tokens > 0).then_some(self.max_tokens),
        };
        let engine = self.model.engine_model().clone();
        let cache = self
            .services
            .executor
            .run(move || engine.new_cache(&params))??;
        Ok(cache.shared())
    }

    /// Drop the active cursor, if any, and report its metrics.
    fn end_generation(&mut self) {
        if let Some(generation) = self.generation.take() {
            drop(generation.cursor);
            generation.timer.finish();
            self.state = SessionState::Done;
        }
        self.sync_tokens_to_cache();
    }

    /// Forget pulled tokens the engine never wrote.
    fn sync_tokens_to_cache(&mut self) {
        let offset = self.checked_offset();
        self.tokens.truncate(offset);
    }

    fn checked_offset(&self) -> usize {
        let Some(cache) = &self.cache else {
            assert!(self.tokens.is_empty(), "tokens recorded without a cache");
            return 0;
        };
        let cache = cache.lock();
        assert!(cache.is_synchronized(), "cache layers out of sync: {cache:?}");
        let offset = cache.offset();
        assert!(
            offset <= self.tokens.len(),
            "cache holds {offset} positions but only {} tokens are known",
            self.tokens.len()
        );
        offset
    }

    fn check_invariant(&self) {
        self.checked_offset();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            generation.timer.finish();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model.id())
            .field("state", &self.state)
            .field("max_tokens", &self.max_tokens)
            .field("tokens", &self.tokens.len())
            .field("pending", &self.pending.as_ref().map(Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_prefix() {
        assert_eq!(common_prefix_len(&[1, 2, 3, 4, 5], &[1, 2, 3]), 3);
        assert_eq!(common_prefix_len(&[1, 2, 9], &[1, 2, 3]), 2);
        assert_eq!(common_prefix_len(&[1, 2, 3], &[1, 2, 3]), 3);
        assert_eq!(common_prefix_len(&[7], &[1, 2, 3]), 0);
        assert_eq!(common_prefix_len(&[1], &[]), 0);
    }
}
