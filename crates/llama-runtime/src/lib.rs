//! # llama-runtime
//!
//! Process-level plumbing for the llama.rs C boundary.
//!
//! Supports:
//! - [`HandleRegistry`]: concurrent map from small integer handles to shared objects
//! - [`IdGenerator`]: process-stable, strictly increasing identities
//! - [`Executor`]: dedicated OS thread that runs blocking engine work
//! - Telemetry hooks for generation latency and throughput

pub mod executor;
pub mod registry;
pub mod telemetry;

pub use executor::{Executor, ExecutorError};
pub use registry::{Handle, HandleRegistry, IdGenerator, RegistryError, INVALID_HANDLE};
pub use telemetry::{
    GenerationMetrics, GenerationTimer, NoopTelemetry, RecordingTelemetry, TelemetryHook,
    TracingTelemetry,
};
