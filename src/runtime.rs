//! Process-wide runtime: registries, model loading and every boundary
//! operation as a safe Rust API.
//!
//! The C exports in [`crate::ffi`] are thin wrappers over [`Runtime`]; Rust
//! hosts can call it directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use llama_engine::{InferenceEngine, ModelSpec, SamplingConfig, TokenId};
use llama_runtime::{
    Executor, Handle, HandleRegistry, IdGenerator, TelemetryHook, TracingTelemetry,
};
use llama_tokenizer::detect_byte_decoding;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{FfiError, Result};
use crate::model::Model;
use crate::session::{NextToken, PrimeReport, Session, SessionServices};

/// Load progress sink: receives a fraction in `[0, 1]`, returns `false` to
/// ask the engine to stop.
pub type ProgressFn = Box<dyn FnMut(f32) -> bool + Send>;

/// Outcome of [`Runtime::next_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOutput {
    /// This many bytes were written to the buffer.
    Written(usize),
    /// A token was produced but had no bytes to emit.
    Empty,
    /// Generation is complete.
    Done,
    /// The buffer is too small; retry with at least this many bytes. The
    /// bytes are kept for the retry.
    TooSmall(usize),
}

/// Outcome of [`Runtime::tokenize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizeOutput {
    Tokens(Vec<TokenId>),
    /// The output buffer is too small; retry with at least this many
    /// tokens. Never 1, for the same reason as [`NextOutput::TooSmall`].
    TooSmall(usize),
}

pub struct Runtime {
    engine: Arc<dyn InferenceEngine>,
    config: RuntimeConfig,
    services: Arc<SessionServices>,
    models: HandleRegistry<Model>,
    sessions: HandleRegistry<Mutex<Session>>,
    /// model id -> handle, for callers that share ids across isolates.
    model_ids: Mutex<HashMap<i64, Handle>>,
    ids: IdGenerator,
    /// Engines are not required to support concurrent loads.
    load_lock: Mutex<()>,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Install the process-wide runtime. Later calls return the runtime that is
/// already installed and ignore their arguments.
pub fn install(engine: Arc<dyn InferenceEngine>, config: RuntimeConfig) -> Result<&'static Runtime> {
    let mut fresh = false;
    let runtime = RUNTIME.get_or_try_init(|| {
        fresh = true;
        Runtime::new(engine, config)
    })?;
    if fresh {
        tracing::info!(config = ?runtime.config, "runtime installed");
    } else {
        tracing::debug!("runtime already installed");
    }
    Ok(runtime)
}

/// The installed runtime.
pub fn get() -> Result<&'static Runtime> {
    RUNTIME.get().ok_or(FfiError::NotInstalled)
}

impl Runtime {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: RuntimeConfig) -> Result<Self> {
        Self::with_telemetry(engine, config, Arc::new(TracingTelemetry))
    }

    pub fn with_telemetry(
        engine: Arc<dyn InferenceEngine>,
        config: RuntimeConfig,
        telemetry: Arc<dyn TelemetryHook>,
    ) -> Result<Self> {
        let services = Arc::new(SessionServices {
            executor: Executor::spawn("llama-ffi-executor")?,
            prefill_step_size: config.prefill_step_size,
            extra_eos_tokens: config.extra_eos_tokens.clone(),
            telemetry,
        });
        Ok(Self {
            engine,
            config,
            services,
            models: HandleRegistry::new(),
            sessions: HandleRegistry::new(),
            model_ids: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
            load_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ---- models ----

    /// Load the model in directory `path` and register it.
    pub fn load_model(&self, path: &Path, progress: Option<ProgressFn>) -> Result<Handle> {
        let decoding = detect_byte_decoding(path);
        let spec = ModelSpec::new(path).with_cache_limit(self.config.cache_limit_bytes);

        let _guard = self.load_lock.lock();
        let engine = self.engine.clone();
        let loaded = self.services.executor.run(move || {
            let mut progress = progress;
            let mut report = |fraction: f32| progress.as_mut().map_or(true, |f| f(fraction));
            engine.load_model(&spec, &mut report)
        })??;

        let model = Arc::new(Model::new(self.ids.next_id(), loaded, decoding));
        let resolving = model.clone();
        self.services
            .executor
            .run(move || resolving.tokenizer().map(drop))??;

        let id = model.id();
        let handle = self.models.insert_arc(model)?;
        self.model_ids.lock().insert(id, handle);
        tracing::info!(handle, id, ?decoding, path = %path.display(), "model loaded");
        Ok(handle)
    }

    /// Unregister a model. Sessions created from it keep it alive.
    pub fn free_model(&self, handle: Handle) -> Result<()> {
        let model = self
            .models
            .remove(handle)
            .ok_or(FfiError::InvalidModel(handle))?;
        self.model_ids.lock().remove(&model.id());
        tracing::debug!(handle, id = model.id(), "model freed");
        Ok(())
    }

    pub fn model(&self, handle: Handle) -> Result<Arc<Model>> {
        self.models.get(handle).ok_or(FfiError::InvalidModel(handle))
    }

    pub fn model_id(&self, handle: Handle) -> Result<i64> {
        Ok(self.model(handle)?.id())
    }

    /// Handle of the live model with identity `id`.
    pub fn model_from_id(&self, id: i64) -> Result<Handle> {
        self.model_ids
            .lock()
            .get(&id)
            .copied()
            .filter(|&h| self.models.contains(h))
            .ok_or_else(|| FfiError::InvalidInput(format!("unknown model id {id}")))
    }

    pub fn tokenize(&self, handle: Handle, text: &str, add_special_tokens: bool) -> Result<Vec<TokenId>> {
        Ok(self.model(handle)?.tokenizer()?.encode(text, add_special_tokens)?)
    }

    /// [`tokenize`](Self::tokenize) into a caller buffer of `capacity` tokens.
    pub fn tokenize_into(
        &self,
        handle: Handle,
        text: &str,
        add_special_tokens: bool,
        capacity: usize,
    ) -> Result<TokenizeOutput> {
        let tokens = self.tokenize(handle, text, add_special_tokens)?;
        Ok(if tokens.len() > capacity {
            TokenizeOutput::TooSmall(tokens.len().max(2))
        } else {
            TokenizeOutput::Tokens(tokens)
        })
    }

    pub fn is_end_of_generation(&self, handle: Handle, token: TokenId) -> Result<bool> {
        self.model(handle)?.is_end_of_generation(token)
    }

    // ---- sessions ----

    pub fn create_session(&self, model: Handle, max_tokens: usize) -> Result<Handle> {
        let model = self.model(model)?;
        let session = Session::new(model, max_tokens, self.services.clone());
        let handle = self.sessions.insert(Mutex::new(session))?;
        tracing::debug!(handle, max_tokens, "session created");
        Ok(handle)
    }

    pub fn free_session(&self, handle: Handle) -> Result<()> {
        self.sessions
            .remove(handle)
            .map(drop)
            .ok_or(FfiError::InvalidSession(handle))
    }

    fn session(&self, handle: Handle) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .get(handle)
            .ok_or(FfiError::InvalidSession(handle))
    }

    pub fn reset_session(&self, handle: Handle) -> Result<()> {
        self.session(handle)?.lock().reset();
        Ok(())
    }

    pub fn begin_generation(
        &self,
        handle: Handle,
        tokens: &[TokenId],
        sampling: SamplingConfig,
    ) -> Result<PrimeReport> {
        self.session(handle)?.lock().begin(tokens, sampling)
    }

    /// Pull the next token and copy its bytes into `buf`.
    pub fn next_token(&self, handle: Handle, buf: &mut [u8]) -> Result<NextOutput> {
        let session = self.session(handle)?;
        let mut session = session.lock();
        Ok(match session.next()? {
            NextToken::Done => NextOutput::Done,
            NextToken::Empty => NextOutput::Empty,
            NextToken::Bytes(bytes) if bytes.len() > buf.len() => {
                // Never report 1: the C side would read -1 as completion.
                let required = bytes.len().max(2);
                session.hold_back(bytes);
                NextOutput::TooSmall(required)
            }
            NextToken::Bytes(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                NextOutput::Written(bytes.len())
            }
        })
    }

    pub fn cache_token_count(&self, handle: Handle) -> Result<usize> {
        Ok(self.session(handle)?.lock().cache_token_count())
    }

    pub fn trim_cache_end(&self, handle: Handle, n: usize) -> Result<usize> {
        Ok(self.session(handle)?.lock().trim_cache_end(n))
    }

    pub fn trim_cache_front(&self, handle: Handle, n: usize) -> Result<usize> {
        Ok(self.session(handle)?.lock().trim_cache_front(n))
    }

    /// Drop every session and model. Handles issued so far stay invalid.
    pub fn shutdown(&self) {
        let sessions = self.sessions.drain().len();
        let models = self.models.drain().len();
        self.model_ids.lock().clear();
        tracing::info!(sessions, models, "runtime shut down");
    }
}
