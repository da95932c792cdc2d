//! Scripted in-process backend for tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::inference::backend::{
    check_status, LoraAdapter, NativeBackend, NativeContext, NativeError, RunRequest,
};
use crate::inference::config::{EngineConfig, NativeChatTemplate};
use crate::inference::engine::EngineHandle;
use crate::inference::input::InputPayload;
use crate::inference::streaming::{dispatch, CallbackEvent, RunId};
use crate::inference::telemetry::PerfStats;

/// One action of a scripted run
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(Vec<u8>),
    Waiting,
    Finish(PerfStats),
    Error(i32),
    Pause(Duration),
    /// Idles until aborted or the duration passes
    WaitForAbort(Duration),
    /// Sleeps and ignores aborts, like a stuck native call
    Hang(Duration),
    /// Returns from `run` with this status, without a terminal event
    Return(i32),
}

impl Step {
    pub fn text(s: &str) -> Self {
        Step::Chunk(s.as_bytes().to_vec())
    }

    pub fn finish(prefill_tokens: u32, generate_tokens: u32) -> Self {
        Step::Finish(PerfStats {
            prefill_time_ms: 5.0,
            prefill_tokens,
            generate_time_ms: 10.0,
            generate_tokens,
            memory_usage_mb: 256.0,
        })
    }

    fn ends_run(&self) -> bool {
        matches!(self, Step::Finish(_) | Step::Error(_) | Step::Return(_))
    }
}

#[derive(Default)]
struct ScriptState {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    aborted: AtomicBool,
    inits: AtomicUsize,
    runs: AtomicUsize,
    aborts: AtomicUsize,
    destroys: AtomicUsize,
    templates: AtomicUsize,
    clears: AtomicUsize,
    cache_loads: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    keep_history: Mutex<Vec<bool>>,
    lora_names: Mutex<Vec<String>>,
}

/// Replays queued scripts through [`dispatch`], one script per run
#[derive(Default)]
pub struct ScriptedBackend {
    state: Arc<ScriptState>,
    fail_init: Option<i32>,
    no_prompt_cache: bool,
    detached: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_init(mut self, code: i32) -> Self {
        self.fail_init = Some(code);
        self
    }

    pub fn without_prompt_cache(mut self) -> Self {
        self.no_prompt_cache = true;
        self
    }

    /// Plays scripts on a separate thread and returns from `run` at once
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        self.push_script(steps);
        self
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        self.state.scripts.lock().unwrap().push_back(steps);
    }

    pub fn init_calls(&self) -> usize {
        self.state.inits.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.destroys.load(Ordering::SeqCst)
    }

    pub fn template_calls(&self) -> usize {
        self.state.templates.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.state.clears.load(Ordering::SeqCst)
    }

    pub fn prompt_cache_loads(&self) -> usize {
        self.state.cache_loads.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn keep_history_flags(&self) -> Vec<bool> {
        self.state.keep_history.lock().unwrap().clone()
    }

    pub fn lora_names(&self) -> Vec<String> {
        self.state.lora_names.lock().unwrap().clone()
    }
}

fn play(state: &ScriptState, run: RunId, steps: Vec<Step>) -> Result<(), NativeError> {
    let mut i = 0;
    let mut result = Ok(());
    while i < steps.len() {
        let step = &steps[i];
        if state.aborted.load(Ordering::SeqCst) && !step.ends_run() && !matches!(step, Step::Hang(_)) {
            match steps[i..].iter().position(Step::ends_run) {
                Some(offset) => {
                    i += offset;
                    continue;
                }
                None => break,
            }
        }
        match step {
            Step::Chunk(bytes) => {
                dispatch(run, CallbackEvent::TokenChunk(bytes.clone()));
            }
            Step::Waiting => {
                dispatch(run, CallbackEvent::Waiting);
            }
            Step::Finish(stats) => {
                dispatch(run, CallbackEvent::Finished(*stats));
            }
            Step::Error(code) => {
                dispatch(run, CallbackEvent::Error(*code));
            }
            Step::Pause(d) | Step::Hang(d) => thread::sleep(*d),
            Step::WaitForAbort(d) => {
                let deadline = Instant::now() + *d;
                while !state.aborted.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Step::Return(code) => {
                result = check_status("rkllm_run", *code);
                break;
            }
        }
        i += 1;
    }
    result
}

impl NativeBackend for ScriptedBackend {
    fn init(&self, _config: &EngineConfig, _model_path: &Path) -> Result<NativeContext, NativeError> {
        self.state.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.fail_init {
            return Err(NativeError::Status {
                op: "rkllm_init",
                code,
            });
        }
        Ok(NativeContext::from_raw(0x1000))
    }

    fn run(&self, _ctx: NativeContext, request: &RunRequest<'_>) -> Result<(), NativeError> {
        self.state.runs.fetch_add(1, Ordering::SeqCst);
        self.state.aborted.store(false, Ordering::SeqCst);
        let recorded = match &request.input.payload {
            InputPayload::Prompt(text) => text.clone(),
            other => other.mode().to_string(),
        };
        self.state.prompts.lock().unwrap().push(recorded);
        self.state.keep_history.lock().unwrap().push(request.keep_history);

        let steps = self
            .state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Finish(PerfStats::default())]);

        if self.detached {
            let state = self.state.clone();
            let run = request.run;
            thread::spawn(move || {
                let _ = play(&state, run, steps);
            });
            return Ok(());
        }
        play(&self.state, request.run, steps)
    }

    fn abort(&self, _ctx: NativeContext) -> Result<(), NativeError> {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        self.state.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self, _ctx: NativeContext) -> Result<(), NativeError> {
        self.state.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_chat_template(
        &self,
        _ctx: NativeContext,
        _template: &NativeChatTemplate,
    ) -> Result<(), NativeError> {
        self.state.templates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_lora(&self, _ctx: NativeContext, adapter: &LoraAdapter) -> Result<(), NativeError> {
        self.state.lora_names.lock().unwrap().push(adapter.name.clone());
        Ok(())
    }

    fn load_prompt_cache(&self, _ctx: NativeContext, _path: &Path) -> Result<(), NativeError> {
        if self.no_prompt_cache {
            return Err(NativeError::Unsupported("rkllm_load_prompt_cache"));
        }
        self.state.cache_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_prompt_cache(&self, _ctx: NativeContext) -> Result<(), NativeError> {
        if self.no_prompt_cache {
            return Err(NativeError::Unsupported("rkllm_release_prompt_cache"));
        }
        Ok(())
    }

    fn clear_kv_cache(&self, _ctx: NativeContext, _keep_system_prompt: bool) -> Result<(), NativeError> {
        self.state.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A plausible `.rkllm` file in a fresh temp dir
pub fn model_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qwen3-0.6b.rkllm");
    std::fs::write(&path, vec![0u8; 128]).unwrap();
    (dir, path)
}

/// An engine over `backend` with a temp model file
pub fn engine_with(backend: &Arc<ScriptedBackend>, config: EngineConfig) -> (TempDir, EngineHandle) {
    let (dir, path) = model_file();
    let engine = EngineHandle::init(backend.clone(), config, &path).unwrap();
    (dir, engine)
}
