//! # llama-runtime
//!
//! Runtime support for the session manager: a deterministic reference
//! [`Engine`](llama_engine::Engine) implementation, memory-mapped model file
//! access, the host memory query, and per-run telemetry.

pub mod memory;
pub mod mmap;
pub mod reference;
pub mod telemetry;

pub use memory::available_memory;
pub use mmap::MappedFile;
pub use reference::{ModelManifest, ReferenceContext, ReferenceEngine, ReferenceModel};
pub use telemetry::{InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, StopReason, TelemetryHook};
