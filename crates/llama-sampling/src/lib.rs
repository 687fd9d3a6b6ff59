//! # llama-sampling
//!
//! Sampling strategies for llama.rs.
//!
//! Supports:
//! - Greedy (argmax) when `temperature <= 0`
//! - Top-k filtering
//! - Min-p filtering
//! - Temperature scaling
//! - Top-p (nucleus) filtering
//! - Repetition penalty over a sliding window of recent tokens
//! - Seeded RNG for reproducible generation (seed 0 = fresh entropy)
//!
//! Filters run in that order on full-precision logits. Reduced-precision
//! inputs (`f16`, `bf16`) are upcast first.

use std::collections::VecDeque;

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Logit value used to knock a candidate out before softmax.
pub const MASKED_LOGIT: f32 = -1e9;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Sampling configuration.
///
/// Every filter defaults to disabled, so a deserialized `{}` is plain
/// temperature sampling.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SamplingConfig {
    /// Softmax temperature. `<= 0` means greedy and ignores every other field.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus mass in `(0, 1)`. Anything else disables top-p.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Keep the K most likely tokens. 0 = disabled.
    #[serde(default)]
    pub top_k: usize,

    /// Drop tokens whose probability is below `min_p * max_prob`. 0 = disabled.
    #[serde(default)]
    pub min_p: f32,

    /// Repetition penalty (1.0 = none). Values > 1.0 discourage repetition.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Number of recent tokens the repetition penalty looks at.
    #[serde(default = "default_repeat_window")]
    pub repeat_window: usize,

    /// RNG seed. 0 draws a fresh, non-deterministic seed.
    #[serde(default)]
    pub seed: u64,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    1.0
}
fn default_repeat_penalty() -> f32 {
    1.0
}
fn default_repeat_window() -> usize {
    64
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: 0,
            min_p: 0.0,
            repeat_penalty: default_repeat_penalty(),
            repeat_window: default_repeat_window(),
            seed: 0,
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling (temperature = 0).
    pub fn greedy() -> Self {
        SamplingConfig {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Whether a repetition penalty should be built for this config.
    pub fn repetition_enabled(&self) -> bool {
        self.repeat_penalty > 1.0 && self.repeat_window > 0
    }
}

/// A borrowed logits row in whatever precision the engine produced.
#[derive(Debug, Clone, Copy)]
pub enum Logits<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    Bf16(&'a [bf16]),
}

impl Logits<'_> {
    pub fn len(&self) -> usize {
        match self {
            Logits::F32(l) => l.len(),
            Logits::F16(l) => l.len(),
            Logits::Bf16(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full-precision copy.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Logits::F32(l) => l.to_vec(),
            Logits::F16(l) => l.iter().map(|v| v.to_f32()).collect(),
            Logits::Bf16(l) => l.iter().map(|v| v.to_f32()).collect(),
        }
    }
}

impl<'a> From<&'a [f32]> for Logits<'a> {
    fn from(l: &'a [f32]) -> Self {
        Logits::F32(l)
    }
}

impl<'a> From<&'a Vec<f32>> for Logits<'a> {
    fn from(l: &'a Vec<f32>) -> Self {
        Logits::F32(l)
    }
}

impl<'a> From<&'a [bf16]> for Logits<'a> {
    fn from(l: &'a [bf16]) -> Self {
        Logits::Bf16(l)
    }
}

impl<'a> From<&'a [f16]> for Logits<'a> {
    fn from(l: &'a [f16]) -> Self {
        Logits::F16(l)
    }
}

/// Stateful sampler. All draws come from one seed-derived RNG, so a
/// non-zero seed reproduces the same sequence of picks.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = if config.seed != 0 {
            StdRng::seed_from_u64(config.seed)
        } else {
            StdRng::from_entropy()
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick a vocabulary index from one row of logits.
    pub fn sample<'a>(&mut self, logits: impl Into<Logits<'a>>) -> SamplingResult<usize> {
        let logits = logits.into();
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        let mut logits = logits.to_f32();
        let cfg = self.config;

        if cfg.temperature <= 0.0 {
            return Ok(argmax(&logits));
        }

        if cfg.top_k > 0 {
            apply_top_k(&mut logits, cfg.top_k);
        }

        if cfg.min_p > 0.0 {
            apply_min_p(&mut logits, cfg.min_p);
        }

        for l in &mut logits {
            *l /= cfg.temperature;
        }

        if cfg.top_p > 0.0 && cfg.top_p < 1.0 {
            self.sample_top_p(&logits, cfg.top_p)
        } else {
            let probs = softmax(&logits);
            self.categorical(&probs)
        }
    }

    /// Nucleus draw: rank candidates by ascending probability, drop the low
    /// tail whose cumulative mass stays within `1 - top_p`, draw from the rest.
    fn sample_top_p(&mut self, logits: &[f32], top_p: f32) -> SamplingResult<usize> {
        let probs = softmax(logits);
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

        let tail = 1.0 - top_p;
        let mut cumsum = 0.0f32;
        let kept: Vec<f32> = order
            .iter()
            .map(|&i| {
                cumsum += probs[i];
                if cumsum > tail {
                    probs[i]
                } else {
                    0.0
                }
            })
            .collect();

        let rank = self.categorical(&kept)?;
        Ok(order[rank])
    }

    /// Draw an index proportionally to `weights` (need not be normalized).
    fn categorical(&mut self, weights: &[f32]) -> SamplingResult<usize> {
        let total: f64 = weights.iter().map(|&w| w as f64).sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(SamplingError::NoValidTokens);
        }

        let r = self.rng.gen::<f64>() * total;
        let mut cumsum = 0.0f64;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            cumsum += w as f64;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Rounding can leave r just past the last bucket.
        weights
            .iter()
            .rposition(|&w| w > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}

/// Keep logits at or above the k-th largest value.
fn apply_top_k(logits: &mut [f32], top_k: usize) {
    let k = top_k.min(logits.len());
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for l in logits.iter_mut() {
        if *l < threshold {
            *l = MASKED_LOGIT;
        }
    }
}

/// Mask logits whose probability is below `min_p` times the top probability.
fn apply_min_p(logits: &mut [f32], min_p: f32) {
    let probs = softmax(logits);
    let max_prob = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = max_prob * min_p;
    for (l, p) in logits.iter_mut().zip(&probs) {
        if *p < threshold {
            *l = MASKED_LOGIT;
        }
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Index of the first maximum.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Repetition penalty over the most recent `window` tokens.
///
/// Positive logits of recently seen tokens are divided by the penalty and
/// negative ones multiplied, which makes a repeat less likely either way.
#[derive(Debug, Clone)]
pub struct RepetitionPenalty {
    penalty: f32,
    window: usize,
    history: VecDeque<i32>,
}

impl RepetitionPenalty {
    pub fn new(penalty: f32, window: usize) -> Self {
        Self {
            penalty,
            window,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Build a penalty only when the config enables one.
    pub fn from_config(config: &SamplingConfig) -> Option<Self> {
        config
            .repetition_enabled()
            .then(|| Self::new(config.repeat_penalty, config.repeat_window))
    }

    /// Seed the window with prompt tokens.
    pub fn prompt(&mut self, tokens: &[i32]) {
        for &t in tokens {
            self.did_sample(t);
        }
    }

    /// Record a produced token.
    pub fn did_sample(&mut self, token: i32) {
        if self.window == 0 {
            return;
        }
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Penalize every token currently in the window (once per distinct token).
    pub fn apply(&self, logits: &mut [f32]) {
        let mut seen = std::collections::HashSet::new();
        for &token in &self.history {
            let Ok(idx) = usize::try_from(token) else {
                continue;
            };
            if idx >= logits.len() || !seen.insert(idx) {
                continue;
            }
            if logits[idx] > 0.0 {
                logits[idx] /= self.penalty;
            } else {
                logits[idx] *= self.penalty;
            }
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &i32> {
        self.history.iter()
    }
}
