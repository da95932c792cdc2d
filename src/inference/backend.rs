//! Native backend seam
//!
//! [`NativeBackend`] is the boundary between the session machinery and the
//! runtime's C ABI. The production implementation is
//! [`RkllmLibrary`](crate::inference::library::RkllmLibrary); anything that
//! can run a generation and report progress through
//! [`dispatch`](crate::inference::streaming::dispatch) fits here.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::inference::config::{EngineConfig, NativeChatTemplate};
use crate::inference::input::RunInput;
use crate::inference::streaming::RunId;

/// Errors reported by a native backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("{op} returned status {code}")]
    Status { op: &'static str, code: i32 },

    #[error("Native library does not export {0}")]
    Unsupported(&'static str),

    #[error("Failed to load native library: {0}")]
    Library(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl NativeError {
    /// Native status code, if the runtime produced one
    pub fn code(&self) -> Option<i32> {
        match self {
            NativeError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Turns a native status into a result
pub fn check_status(op: &'static str, code: i32) -> Result<(), NativeError> {
    if code == 0 {
        Ok(())
    } else {
        Err(NativeError::Status { op, code })
    }
}

/// Opaque address of a native context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeContext(usize);

impl NativeContext {
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// A LoRA adapter to load into a context
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub path: PathBuf,
    pub name: String,
    pub scale: f32,
}

impl LoraAdapter {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            scale: 1.0,
        }
    }
}

/// Everything `rkllm_run` needs for one generation
#[derive(Debug)]
pub struct RunRequest<'a> {
    /// Travels as the callback `userdata` pointer
    pub run: RunId,
    pub input: &'a RunInput,
    pub keep_history: bool,
    pub lora_adapter: Option<&'a str>,
    /// Save the prompt cache of this run to the given file
    pub save_prompt_cache: Option<&'a Path>,
}

/// Operations of the native runtime.
///
/// `run` blocks the calling thread; every event it produces must be routed
/// through [`dispatch`](crate::inference::streaming::dispatch) with the
/// request's run id, ending with exactly one terminal event.
pub trait NativeBackend: Send + Sync {
    fn init(&self, config: &EngineConfig, model_path: &Path) -> Result<NativeContext, NativeError>;

    fn run(&self, ctx: NativeContext, request: &RunRequest<'_>) -> Result<(), NativeError>;

    fn abort(&self, ctx: NativeContext) -> Result<(), NativeError>;

    fn destroy(&self, ctx: NativeContext) -> Result<(), NativeError>;

    fn set_chat_template(
        &self,
        ctx: NativeContext,
        template: &NativeChatTemplate,
    ) -> Result<(), NativeError>;

    fn load_lora(&self, ctx: NativeContext, adapter: &LoraAdapter) -> Result<(), NativeError>;

    fn load_prompt_cache(&self, ctx: NativeContext, path: &Path) -> Result<(), NativeError>;

    fn release_prompt_cache(&self, ctx: NativeContext) -> Result<(), NativeError>;

    /// Drops the retained conversation from the native KV cache
    fn clear_kv_cache(&self, ctx: NativeContext, keep_system_prompt: bool)
        -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status("rkllm_run", 0).is_ok());
        let err = check_status("rkllm_run", -1).unwrap_err();
        assert_eq!(err.code(), Some(-1));
        assert_eq!(err.to_string(), "rkllm_run returned status -1");
    }

    #[test]
    fn test_native_context_roundtrip() {
        let mut value = 7u8;
        let ptr = &mut value as *mut u8 as *mut c_void;
        let ctx = NativeContext::from_ptr(ptr);
        assert_eq!(ctx.as_ptr(), ptr);
        assert!(!ctx.is_null());
        assert!(NativeContext::from_raw(0).is_null());
    }
}
