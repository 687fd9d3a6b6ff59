//! Telemetry hooks for generation performance measurement.
//!
//! Provides:
//! - [`GenerationMetrics`]: prime latency, prefix reuse, tokens/sec
//! - [`TelemetryHook`] trait: callback interface for metric reporting
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`TracingTelemetry`] / [`RecordingTelemetry`]: built-in hooks

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Aggregate metrics from one generation (begin through completion).
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMetrics {
    /// Tokens in the input sequence passed to begin.
    pub prompt_tokens: usize,
    /// Leading input tokens served from the existing cache.
    pub reused_tokens: usize,
    /// Time spent priming (prefill plus first sample setup), in milliseconds.
    pub prime_ms: f64,
    /// Tokens pulled from the decode cursor, stop token included.
    pub generated_tokens: usize,
    /// Decode throughput, excluding priming.
    pub tokens_per_sec: f64,
    /// Wall-clock time from begin to completion, in milliseconds.
    pub total_time_ms: f64,
}

/// Callback trait for generation telemetry.
///
/// All methods default to no-ops so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the engine has been primed.
    fn on_primed(&self, _prompt_tokens: usize, _reused_tokens: usize, _prime_ms: f64) {}

    /// Called after each token pulled from the cursor.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation completes, with the full summary.
    fn on_generation_complete(&self, _metrics: &GenerationMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Emits metrics as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_primed(&self, prompt_tokens: usize, reused_tokens: usize, prime_ms: f64) {
        tracing::debug!(prompt_tokens, reused_tokens, prime_ms, "primed");
    }

    fn on_generation_complete(&self, m: &GenerationMetrics) {
        tracing::info!(
            prompt_tokens = m.prompt_tokens,
            reused_tokens = m.reused_tokens,
            generated_tokens = m.generated_tokens,
            prime_ms = m.prime_ms,
            tokens_per_sec = m.tokens_per_sec,
            "generation complete"
        );
    }
}

/// Keeps the last completed report for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    last_report: Arc<Mutex<Option<GenerationMetrics>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.last_report.lock().clone()
    }
}

impl TelemetryHook for RecordingTelemetry {
    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        *self.last_report.lock() = Some(metrics.clone());
    }
}

/// Records timestamps across one generation to compute [`GenerationMetrics`].
///
/// Usage:
/// 1. [`GenerationTimer::start`] when begin is called
/// 2. [`mark_primed`](Self::mark_primed) after the engine returns a cursor
/// 3. [`mark_token`](Self::mark_token) after each pulled token
/// 4. [`finish`](Self::finish) when generation completes
pub struct GenerationTimer {
    prompt_tokens: usize,
    reused_tokens: usize,
    start: Instant,
    primed_at: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn start(prompt_tokens: usize, reused_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            reused_tokens,
            start: Instant::now(),
            primed_at: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_primed(&mut self) {
        let now = Instant::now();
        self.primed_at = Some(now);
        let prime_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook
            .on_primed(self.prompt_tokens, self.reused_tokens, prime_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    pub fn generated_tokens(&self) -> usize {
        self.token_count
    }

    pub fn finish(self) -> GenerationMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let prime_ms = self
            .primed_at
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - prime_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            prompt_tokens: self.prompt_tokens,
            reused_tokens: self.reused_tokens,
            prime_ms,
            generated_tokens: self.token_count,
            tokens_per_sec,
            total_time_ms,
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
