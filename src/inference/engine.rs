//! Engine handle
//!
//! Owns one native context and the exclusivity flag that keeps at most one
//! run in flight on it.
//!
//! # Architecture
//!
//! `rkllm_run` blocks its calling thread for the whole response, so every run
//! executes on a dedicated worker thread (see [`session`](crate::inference::session)).
//! The worker and the consumer share the context through an
//! `Arc<EngineShared>`; the native context is destroyed exactly once, either by
//! [`EngineHandle::destroy`] or when the last reference goes away.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::inference::backend::{LoraAdapter, NativeBackend, NativeContext, NativeError};
use crate::inference::config::{EngineConfig, NativeChatTemplate};
use crate::inference::library::RkllmLibrary;
use crate::inference::model::{validate_aux_file, validate_model_file, ModelError};
use crate::inference::streaming::RunId;
use crate::types::ChatMessage;

/// Errors that can occur during engine and session operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to initialize engine: {0}")]
    Init(String),

    #[error("Native run failed with code {0}")]
    Run(i32),

    #[error("A generation is already running on this engine")]
    SessionBusy,

    #[error("Run {run} did not terminate within {grace:?} after abort")]
    CancellationTimeout { run: RunId, grace: Duration },

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Worker thread error: {0}")]
    Worker(String),

    #[error("Model validation failed: {0}")]
    Model(String),

    #[error("Engine has been destroyed")]
    Destroyed,
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::Model(e.to_string())
    }
}

/// What the native context already holds of the conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HistoryState {
    /// Conversation messages retained by the KV cache, including the last reply
    pub consumed: usize,
    /// A keep-history turn ended badly; the cache no longer matches `consumed`
    pub dirty: bool,
    /// Messages sent to the runtime so far; a new turn must start with these
    pub transcript: Vec<ChatMessage>,
}

impl HistoryState {
    /// Whether `messages` extends what the native context holds by at least
    /// one new message
    pub(crate) fn extended_by(&self, messages: &[ChatMessage]) -> bool {
        !self.dirty
            && self.consumed > 0
            && self.consumed < messages.len()
            && messages.starts_with(&self.transcript)
    }
}

/// State shared between a handle and the workers of its runs
pub(crate) struct EngineShared {
    backend: Arc<dyn NativeBackend>,
    ctx: NativeContext,
    config: EngineConfig,
    model_path: PathBuf,
    running: AtomicBool,
    destroyed: AtomicBool,
    history: Mutex<HistoryState>,
}

impl EngineShared {
    pub(crate) fn backend(&self) -> &dyn NativeBackend {
        self.backend.as_ref()
    }

    pub(crate) fn ctx(&self) -> NativeContext {
        self.ctx
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Claims the context for one operation. Fails without any native call.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Result<RunGuard, EngineError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(EngineError::Destroyed);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::SessionBusy);
        }
        Ok(RunGuard {
            shared: self.clone(),
        })
    }

    pub(crate) fn abort_native(&self) -> Result<(), EngineError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(EngineError::Destroyed);
        }
        self.backend.abort(self.ctx)?;
        Ok(())
    }

    pub(crate) fn history(&self) -> HistoryState {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_history(&self, state: HistoryState) {
        match self.history.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn destroy_native(&self) -> Result<(), NativeError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.backend.destroy(self.ctx);
        tracing::info!("Engine for {} destroyed", self.model_path.display());
        result
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_native() {
            tracing::warn!("Failed to destroy native context: {}", e);
        }
    }
}

/// Marks the context busy until dropped
pub(crate) struct RunGuard {
    shared: Arc<EngineShared>,
}

impl RunGuard {
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

/// Exclusive owner of one initialised native context.
///
/// Sampling parameters are fixed at init. Create a new handle to change them.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Initialises a context with no LoRA adapter or prompt cache
    pub fn init<P: AsRef<Path>>(
        backend: Arc<dyn NativeBackend>,
        config: EngineConfig,
        model_path: P,
    ) -> Result<Self, EngineError> {
        Self::init_with(backend, config, model_path, None, None)
    }

    /// Initialises a context, optionally loading a LoRA adapter and a saved
    /// prompt cache.
    ///
    /// # Arguments
    /// * `backend` - Native runtime to drive
    /// * `config` - Sampling/context parameters, clamped into range first
    /// * `model_path` - Path to the `.rkllm` model
    /// * `lora` - Adapter loaded right after init
    /// * `prompt_cache` - Prompt cache file loaded right after init
    ///
    /// # Returns
    /// * `Ok(EngineHandle)` - A ready handle
    /// * `Err(EngineError)` - `Model` for bad files, `Init` for native failures
    pub fn init_with<P: AsRef<Path>>(
        backend: Arc<dyn NativeBackend>,
        mut config: EngineConfig,
        model_path: P,
        lora: Option<&LoraAdapter>,
        prompt_cache: Option<&Path>,
    ) -> Result<Self, EngineError> {
        let model_path = model_path.as_ref();
        config.validate();

        let info = validate_model_file(model_path)?;
        tracing::debug!("Model file {} ({} bytes) passed validation", info.filename, info.size_bytes);
        if let Some(adapter) = lora {
            validate_aux_file(&adapter.path)?;
        }
        if let Some(path) = prompt_cache {
            validate_aux_file(path)?;
        }

        let ctx = backend
            .init(&config, model_path)
            .map_err(|e| EngineError::Init(e.to_string()))?;

        // From here on, dropping `shared` releases the context
        let shared = Arc::new(EngineShared {
            backend,
            ctx,
            config,
            model_path: model_path.to_path_buf(),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            history: Mutex::new(HistoryState::default()),
        });

        shared
            .backend
            .set_chat_template(ctx, &shared.config.chat_template)
            .map_err(|e| EngineError::Init(e.to_string()))?;

        if let Some(adapter) = lora {
            shared
                .backend
                .load_lora(ctx, adapter)
                .map_err(|e| EngineError::Init(e.to_string()))?;
            tracing::info!("Loaded LoRA adapter '{}'", adapter.name);
        }
        if let Some(path) = prompt_cache {
            shared
                .backend
                .load_prompt_cache(ctx, path)
                .map_err(|e| EngineError::Init(e.to_string()))?;
            tracing::info!("Loaded prompt cache {}", path.display());
        }

        tracing::info!(
            "Engine initialized: {} (ctx {}, max_new_tokens {}, {} cpus{})",
            info.filename,
            shared.config.max_context_len,
            shared.config.max_new_tokens,
            shared.config.enabled_cpus(),
            if shared.config.is_async { ", async" } else { "" }
        );

        Ok(Self { shared })
    }

    /// Loads `librkllmrt` from `library_path` and initialises a context on it
    pub fn open<L: AsRef<Path>, P: AsRef<Path>>(
        library_path: L,
        config: EngineConfig,
        model_path: P,
        lora: Option<&LoraAdapter>,
        prompt_cache: Option<&Path>,
    ) -> Result<Self, EngineError> {
        let library =
            RkllmLibrary::load(library_path).map_err(|e| EngineError::Init(e.to_string()))?;
        Self::init_with(Arc::new(library), config, model_path, lora, prompt_cache)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn model_path(&self) -> &Path {
        &self.shared.model_path
    }

    /// Returns true while a run (or another native operation) holds the context
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn set_chat_template(&self, template: &NativeChatTemplate) -> Result<(), EngineError> {
        let _guard = self.shared.try_acquire()?;
        self.shared
            .backend
            .set_chat_template(self.shared.ctx, template)?;
        Ok(())
    }

    pub fn load_lora(&self, adapter: &LoraAdapter) -> Result<(), EngineError> {
        validate_aux_file(&adapter.path)?;
        let _guard = self.shared.try_acquire()?;
        self.shared.backend.load_lora(self.shared.ctx, adapter)?;
        tracing::info!("Loaded LoRA adapter '{}'", adapter.name);
        Ok(())
    }

    pub fn load_prompt_cache<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let path = path.as_ref();
        validate_aux_file(path)?;
        let _guard = self.shared.try_acquire()?;
        self.shared.backend.load_prompt_cache(self.shared.ctx, path)?;
        Ok(())
    }

    pub fn release_prompt_cache(&self) -> Result<(), EngineError> {
        let _guard = self.shared.try_acquire()?;
        self.shared.backend.release_prompt_cache(self.shared.ctx)?;
        Ok(())
    }

    /// Forgets the conversation retained by keep-history runs
    pub fn clear_history(&self, keep_system_prompt: bool) -> Result<(), EngineError> {
        let _guard = self.shared.try_acquire()?;
        self.shared
            .backend
            .clear_kv_cache(self.shared.ctx, keep_system_prompt)?;
        self.shared.set_history(HistoryState::default());
        tracing::debug!("Cleared native history");
        Ok(())
    }

    /// Asks the runtime to stop the in-flight run, if any.
    ///
    /// Prefer [`CancelHandle`](crate::inference::cancel::CancelHandle), which
    /// also wakes the consumer and is idempotent.
    pub fn abort(&self) -> Result<(), EngineError> {
        if !self.is_running() {
            return Ok(());
        }
        self.shared.abort_native()
    }

    /// Releases the native context.
    ///
    /// Fails with `SessionBusy` while a run is in flight; the context is then
    /// released as soon as that run's worker lets go of it.
    pub fn destroy(self) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::SessionBusy);
        }
        self.shared.destroy_native()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{model_file, ScriptedBackend};

    #[test]
    fn test_history_extension_requires_matching_prefix() {
        let history = HistoryState {
            consumed: 3,
            dirty: false,
            transcript: vec![ChatMessage::system("You are Oki."), ChatMessage::user("Hello")],
        };
        let continued = vec![
            ChatMessage::system("You are Oki."),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi!"),
            ChatMessage::user("How are you?"),
        ];
        assert!(history.extended_by(&continued));
        assert!(!history.extended_by(&continued[..3]));

        let unrelated = vec![
            ChatMessage::system("You are a pirate."),
            ChatMessage::user("Ahoy"),
            ChatMessage::assistant("Arr"),
            ChatMessage::user("Where is the treasure?"),
        ];
        assert!(!history.extended_by(&unrelated));
        assert!(!HistoryState { dirty: true, ..history }.extended_by(&continued));
    }

    #[test]
    fn test_init_validates_model_before_native_call() {
        let backend = Arc::new(ScriptedBackend::new());
        let result = EngineHandle::init(
            backend.clone(),
            EngineConfig::default(),
            "/nonexistent/model.rkllm",
        );
        assert!(matches!(result, Err(EngineError::Model(_))));
        assert_eq!(backend.init_calls(), 0);
    }

    #[test]
    fn test_init_failure_is_init_error() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new().failing_init(-2));
        let result = EngineHandle::init(backend.clone(), EngineConfig::default(), &model);
        assert!(matches!(result, Err(EngineError::Init(_))));
        assert_eq!(backend.destroy_calls(), 0);
    }

    #[test]
    fn test_init_clamps_config_and_sets_template() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new());
        let config = EngineConfig {
            max_context_len: 1_000_000,
            ..Default::default()
        };
        let engine = EngineHandle::init(backend.clone(), config, &model).unwrap();
        assert_eq!(engine.config().max_context_len, 16384);
        assert_eq!(backend.template_calls(), 1);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_init_with_lora_and_cache() {
        let (dir, model) = model_file();
        let lora_path = dir.path().join("adapter.rkllm");
        let cache_path = dir.path().join("prompt.bin");
        std::fs::write(&lora_path, b"lora").unwrap();
        std::fs::write(&cache_path, b"cache").unwrap();

        let backend = Arc::new(ScriptedBackend::new());
        let adapter = LoraAdapter::new(&lora_path, "style");
        EngineHandle::init_with(
            backend.clone(),
            EngineConfig::default(),
            &model,
            Some(&adapter),
            Some(&cache_path),
        )
        .unwrap();
        assert_eq!(backend.lora_names(), vec!["style".to_string()]);
        assert_eq!(backend.prompt_cache_loads(), 1);
    }

    #[test]
    fn test_destroy_once() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new());
        let engine = EngineHandle::init(backend.clone(), EngineConfig::default(), &model).unwrap();
        engine.destroy().unwrap();
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[test]
    fn test_drop_destroys_context() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new());
        {
            let _engine =
                EngineHandle::init(backend.clone(), EngineConfig::default(), &model).unwrap();
        }
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[test]
    fn test_operations_busy_while_acquired() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new());
        let engine = EngineHandle::init(backend.clone(), EngineConfig::default(), &model).unwrap();

        let guard = engine.shared().try_acquire().unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.clear_history(false), Err(EngineError::SessionBusy));
        assert_eq!(engine.release_prompt_cache(), Err(EngineError::SessionBusy));
        drop(guard);

        assert!(!engine.is_running());
        engine.clear_history(false).unwrap();
        assert_eq!(backend.clear_calls(), 1);
    }

    #[test]
    fn test_unsupported_optional_symbol() {
        let (_dir, model) = model_file();
        let backend = Arc::new(ScriptedBackend::new().without_prompt_cache());
        let engine = EngineHandle::init(backend, EngineConfig::default(), &model).unwrap();
        assert!(matches!(
            engine.release_prompt_cache(),
            Err(EngineError::Native(NativeError::Unsupported(_)))
        ));
    }

    #[test]
    fn test_open_missing_library() {
        let (_dir, model) = model_file();
        let result = EngineHandle::open(
            "/nonexistent/librkllmrt.so",
            EngineConfig::default(),
            &model,
            None,
            None,
        );
        assert!(matches!(result, Err(EngineError::Init(_))));
    }
}
