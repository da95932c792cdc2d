//! RKLLM inference bridge
//!
//! This module drives the native RKLLM runtime and exposes each generation as
//! a cancellable, ordered stream of decoded text.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod ffi;
pub mod input;
pub mod library;
pub mod model;
pub mod prompt;
pub mod session;
pub mod streaming;
pub mod telemetry;
pub mod utf8;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{LoraAdapter, NativeBackend, NativeContext, NativeError, RunRequest};
pub use cancel::CancelHandle;
pub use config::{EngineConfig, GenerationConfig, NativeChatTemplate};
pub use engine::{EngineError, EngineHandle};
pub use input::{ImageMeta, InputPayload, RunInput};
pub use library::RkllmLibrary;
pub use model::{validate_model_file, ModelError, ModelFileInfo};
pub use session::{
    start, start_input, CompletionSummary, GenerationOptions, GenerationStream, SessionState,
    StopReason, StopSet,
};
pub use streaming::{CallbackEvent, RunId, StreamEvent};
pub use telemetry::{PerfStats, TelemetryAggregator, TokenUsage};
pub use utf8::{ByteReassembler, DecodeError};
