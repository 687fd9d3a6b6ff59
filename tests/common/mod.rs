//! Deterministic mock engine shared by the root integration tests.
//!
//! The mock model writes one cache position per fed token during prime and
//! one per token pulled from its cursor, and replays a fixed token script.
//! A lazy-write mock instead writes each pulled token only when the next one
//! is pulled, the way a real engine's token iterator does.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use llama_engine::*;
use llama_ffi::model::Model;
use llama_ffi::session::SessionServices;
use llama_kv::LayerKVCache;
use llama_runtime::{Executor, NoopTelemetry, TelemetryHook};
use llama_tokenizer::{ByteDecoding, TokenizerError, TokenizerResult};

pub const EOS: TokenId = 0;
pub const HELLO: TokenId = 1;
pub const WORLD: TokenId = 2;
pub const BANG: TokenId = 3;
pub const IM_END: TokenId = 4;
pub const BLANK: TokenId = 5;
pub const BOS: TokenId = 6;
pub const CAFE: TokenId = 7;
pub const END_OF_TEXT: TokenId = 8;
/// Prime fails when this token is fed.
pub const POISON: TokenId = 99;

pub const VOCAB: [&str; 9] = [
    "</s>",
    "Hello",
    "Ġworld",
    "!",
    "<|im_end|>",
    "",
    "<s>",
    "ĠcafÃ©",
    "<|endoftext|>",
];

pub struct MockTokenizer;

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TokenizerResult<Vec<i32>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(BOS);
        }
        for word in text.split_whitespace() {
            let id = self
                .token_to_id(word)
                .or_else(|| self.token_to_id(&format!("Ġ{word}")))
                .ok_or_else(|| TokenizerError::EncodingError(format!("unknown word {word:?}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn id_to_token(&self, token: i32) -> Option<String> {
        VOCAB.get(usize::try_from(token).ok()?).map(|s| s.to_string())
    }

    fn token_to_id(&self, token: &str) -> Option<i32> {
        VOCAB
            .iter()
            .position(|v| !v.is_empty() && *v == token)
            .map(|i| i as i32)
    }

    fn eos_token_id(&self) -> Option<i32> {
        Some(EOS)
    }
}

/// Everything the mock observed, shared with the test.
#[derive(Default)]
pub struct Probe {
    /// Tokens passed to each prime call.
    pub fed: Mutex<Vec<Vec<TokenId>>>,
    /// `max_kv_size` of each allocated cache.
    pub caches: Mutex<Vec<Option<usize>>>,
    /// Prefill step size of each prime call.
    pub step_sizes: Mutex<Vec<usize>>,
    /// Model paths loaded.
    pub loads: Mutex<Vec<String>>,
    /// Whether each prime got a repetition processor.
    pub processors: Mutex<Vec<bool>>,
}

impl Probe {
    pub fn last_fed(&self) -> Vec<TokenId> {
        self.fed.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn cache_allocations(&self) -> usize {
        self.caches.lock().unwrap().len()
    }
}

pub struct MockModel {
    config: ModelConfiguration,
    script: Vec<TokenId>,
    probe: Arc<Probe>,
    lazy_writes: bool,
}

struct ScriptedCursor {
    cache: SharedCache,
    script: std::vec::IntoIter<TokenId>,
    lazy_writes: bool,
    /// Yielded but not yet written (lazy mode only).
    unwritten: Option<TokenId>,
}

fn write_position(cache: &SharedCache, token: TokenId) -> Result<()> {
    let mut cache = cache.lock();
    for layer in cache.layers_mut() {
        layer.append(&[token as f32], &[-(token as f32)])?;
    }
    Ok(())
}

impl Iterator for ScriptedCursor {
    type Item = Result<TokenId>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.script.next()?;
        if !self.lazy_writes {
            return Some(write_position(&self.cache, token).map(|_| token));
        }
        if let Some(previous) = self.unwritten.replace(token) {
            if let Err(e) = write_position(&self.cache, previous) {
                return Some(Err(e));
            }
        }
        Some(Ok(token))
    }
}

impl LoadedModel for MockModel {
    fn configuration(&self) -> &ModelConfiguration {
        &self.config
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(MockTokenizer))
    }

    fn new_cache(&self, params: &CacheParameters) -> Result<SessionKVCache> {
        self.probe.caches.lock().unwrap().push(params.max_kv_size);
        let capacity = params.max_kv_size.unwrap_or(256);
        Ok(SessionKVCache::new(
            (0..2)
                .map(|_| Box::new(LayerKVCache::new(capacity, 1, 1)) as Box<dyn KvCache>)
                .collect(),
        ))
    }

    fn prime(&self, request: PrimeRequest) -> Result<DecodeCursor> {
        self.probe.fed.lock().unwrap().push(request.tokens.clone());
        self.probe
            .step_sizes
            .lock()
            .unwrap()
            .push(request.prefill_step_size);
        self.probe
            .processors
            .lock()
            .unwrap()
            .push(request.processor.is_some());

        for &token in &request.tokens {
            if token == POISON {
                return Err(LlamaError::Inference("poisoned prompt".into()));
            }
            write_position(&request.cache, token)?;
        }
        Ok(Box::new(ScriptedCursor {
            cache: request.cache,
            script: self.script.clone().into_iter(),
            lazy_writes: self.lazy_writes,
            unwritten: None,
        }))
    }
}

pub struct MockEngine {
    pub script: Vec<TokenId>,
    pub probe: Arc<Probe>,
}

impl MockEngine {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn model(&self) -> MockModel {
        MockModel {
            config: ModelConfiguration {
                eos_token_ids: HashSet::from([EOS]),
                extra_eos_tokens: vec!["<|im_end|>".to_string(), "<|not-in-vocab|>".to_string()],
            },
            script: self.script.clone(),
            probe: self.probe.clone(),
            lazy_writes: false,
        }
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(
        &self,
        spec: &ModelSpec,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Arc<dyn LoadedModel>> {
        if !spec.path.exists() {
            return Err(LlamaError::ModelLoad(format!(
                "no such directory: {}",
                spec.path.display()
            )));
        }
        for step in 0..=2 {
            if !progress(step as f32 / 2.0) {
                return Err(LlamaError::Cancelled);
            }
        }
        self.probe
            .loads
            .lock()
            .unwrap()
            .push(spec.path.display().to_string());
        Ok(Arc::new(self.model()))
    }
}

/// Services backed by a fresh executor and no telemetry.
pub fn services() -> Arc<SessionServices> {
    services_with(Vec::new(), Arc::new(NoopTelemetry))
}

pub fn services_with(
    extra_eos_tokens: Vec<String>,
    telemetry: Arc<dyn TelemetryHook>,
) -> Arc<SessionServices> {
    Arc::new(SessionServices {
        executor: Executor::spawn("test-executor").unwrap(),
        prefill_step_size: 4096,
        extra_eos_tokens,
        telemetry,
    })
}

/// A [`Model`] over a mock replaying `script`, plus its probe.
pub fn model(script: Vec<TokenId>) -> (Arc<Model>, Arc<Probe>) {
    let engine = MockEngine::new(script);
    let probe = engine.probe.clone();
    let model = Model::new(0, Arc::new(engine.model()), ByteDecoding::ByteLevel);
    (Arc::new(model), probe)
}

/// Like [`model`], but the cursor writes each token one pull late.
pub fn lazy_model(script: Vec<TokenId>) -> (Arc<Model>, Arc<Probe>) {
    let engine = MockEngine::new(script);
    let probe = engine.probe.clone();
    let mock = MockModel {
        lazy_writes: true,
        ..engine.model()
    };
    let model = Model::new(0, Arc::new(mock), ByteDecoding::ByteLevel);
    (Arc::new(model), probe)
}

/// Write a `tokenizer.json` declaring `decoder` into `dir`.
pub fn write_tokenizer_json(dir: &Path, decoder: serde_json::Value) {
    let json = serde_json::json!({ "version": "1.0", "decoder": decoder });
    std::fs::write(dir.join("tokenizer.json"), json.to_string()).unwrap();
}
