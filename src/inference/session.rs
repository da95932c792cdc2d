//! Generation session
//!
//! One session drives one run: it renders the prompt, claims the engine,
//! spawns the worker that blocks inside the native run call, and exposes the
//! decoded text as a [`GenerationStream`].
//!
//! State machine: `Idle -> Running -> {Finished, Errored, Aborted}`. The
//! terminal transition happens on the run's terminal event, or when a
//! requested abort is never acknowledged within the grace period.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::backend::RunRequest;
use crate::inference::cancel::CancelHandle;
use crate::inference::engine::{EngineError, EngineHandle, HistoryState, RunGuard};
use crate::inference::input::{InputPayload, RunInput};
use crate::inference::prompt::{render_continuation, render_conversation};
use crate::inference::streaming::{
    self, RunId, RunSink, StreamEvent, TerminalKind, MISSING_TERMINAL_CODE,
};
use crate::inference::telemetry::{PerfStats, TelemetryAggregator, TokenUsage};
use crate::truncate_str;
use crate::types::{ChatMessage, ChatResponse, ChatRole};

/// How long an abort may take before the run is declared stuck
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

const ASYNC_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The runtime finished on its own (end of sequence or token limit)
    MaxLength,
    /// A stop sequence matched
    StopToken,
    /// The runtime reported an error
    Error,
    /// Cancelled by the caller or by a timeout
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Finished,
    Errored,
    Aborted,
}

/// Per-run settings
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Tool JSON schemas rendered into the system block
    pub tools: Vec<Value>,
    pub stop_sequences: Vec<String>,
    /// Role reported to the runtime for the input
    pub role: ChatRole,
    pub enable_thinking: bool,
    /// Let the native context retain this turn
    pub keep_history: bool,
    /// Cancel the run when it takes longer than this
    pub timeout: Option<Duration>,
    /// How long to wait for the terminal event after an abort
    pub cancel_grace: Duration,
    /// Name of a loaded LoRA adapter to apply
    pub lora_adapter: Option<String>,
    /// Save the prompt cache of this run to the given file
    pub save_prompt_cache: Option<PathBuf>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            stop_sequences: Vec::new(),
            role: ChatRole::User,
            enable_thinking: false,
            keep_history: false,
            timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            lora_adapter: None,
            save_prompt_cache: None,
        }
    }
}

impl GenerationOptions {
    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_role(mut self, role: ChatRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_thinking(mut self, enable_thinking: bool) -> Self {
        self.enable_thinking = enable_thinking;
        self
    }

    pub fn with_keep_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_lora_adapter(mut self, name: impl Into<String>) -> Self {
        self.lora_adapter = Some(name.into());
        self
    }

    pub fn with_prompt_cache_save(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_prompt_cache = Some(path.into());
        self
    }
}

/// Literal stop sequences checked against the tail of the generated text
#[derive(Debug, Clone, Default)]
pub struct StopSet {
    sequences: Vec<String>,
    max_len: usize,
}

impl StopSet {
    pub fn new<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sequences: Vec<String> = sequences
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        sequences.sort();
        sequences.dedup();
        let max_len = sequences.iter().map(String::len).max().unwrap_or(0);
        Self { sequences, max_len }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Finds a sequence ending inside the last `appended` bytes of `text`
    pub fn find_in_tail(&self, text: &str, appended: usize) -> Option<&str> {
        if self.is_empty() || appended == 0 {
            return None;
        }
        let mut start = text
            .len()
            .saturating_sub(appended + self.max_len.saturating_sub(1));
        while start > 0 && !text.is_char_boundary(start) {
            start -= 1;
        }
        let window = &text[start..];
        self.sequences
            .iter()
            .find(|seq| window.contains(seq.as_str()))
            .map(String::as_str)
    }
}

/// Outcome of a drained run
#[derive(Debug, Clone)]
pub struct CompletionSummary {
    pub run: RunId,
    pub state: SessionState,
    pub stop_reason: StopReason,
    /// Token counts; `None` when the run never reported stats
    pub usage: TokenUsage,
    pub perf: Option<PerfStats>,
    pub error: Option<EngineError>,
    /// Every increment yielded to the caller, concatenated
    pub text: String,
    pub increments: usize,
    pub elapsed: Duration,
    pub time_to_first_text: Option<Duration>,
    pub timed_out: bool,
}

enum Wake {
    Event(StreamEvent),
    DeadlineExpired,
    GraceExpired,
    Disconnected,
}

/// Lazy, forward-only sequence of decoded text increments.
///
/// Dropping an unfinished stream cancels the run and waits (up to the grace
/// period) for it to terminate.
pub struct GenerationStream {
    run: RunId,
    rx: Receiver<StreamEvent>,
    cancel: CancelHandle,
    worker: Option<JoinHandle<()>>,
    stops: StopSet,
    telemetry: TelemetryAggregator,
    text: String,
    deadline: Option<Instant>,
    grace: Duration,
    stop_matched: bool,
    timed_out: bool,
    state: SessionState,
    stop_reason: Option<StopReason>,
    error: Option<EngineError>,
}

impl GenerationStream {
    pub fn run_id(&self) -> RunId {
        self.run
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Text yielded so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_done(&self) -> bool {
        self.state != SessionState::Running
    }

    /// A handle that can cancel this run from any thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Requests cancellation; the stream then ends with `Cancelled`
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// The summary, once the stream has ended
    pub fn summary(&self) -> Option<CompletionSummary> {
        if !self.is_done() {
            return None;
        }
        Some(self.build_summary(self.text.clone()))
    }

    /// Drains the rest of the run and returns its summary
    pub fn finish(mut self) -> CompletionSummary {
        while self.next().is_some() {}
        let text = std::mem::take(&mut self.text);
        self.build_summary(text)
    }

    /// Drains the run into an assistant message.
    ///
    /// Native errors and stuck aborts are returned as `Err`; cancelled and
    /// stopped runs are `Ok` with the matching stop reason.
    pub fn into_response(self) -> Result<ChatResponse, EngineError> {
        let summary = self.finish();
        if let Some(error) = summary.error {
            return Err(error);
        }
        Ok(ChatResponse {
            message: ChatMessage::assistant(summary.text),
            usage: summary.usage,
            stop_reason: summary.stop_reason,
        })
    }

    /// Moves the blocking drain onto tokio's blocking pool.
    ///
    /// Must be called from within a tokio runtime. Dropping the receiver
    /// cancels the run.
    pub fn into_async(
        self,
    ) -> (
        tokio::sync::mpsc::UnboundedReceiver<String>,
        tokio::task::JoinHandle<CompletionSummary>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || {
            let mut stream = self;
            while let Some(text) = stream.next() {
                if tx.send(text).is_err() {
                    stream.cancel();
                }
            }
            stream.finish()
        });
        (rx, handle)
    }

    fn build_summary(&self, text: String) -> CompletionSummary {
        CompletionSummary {
            run: self.run,
            state: self.state,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Error),
            usage: self.telemetry.usage(),
            perf: self.telemetry.perf(),
            error: self.error.clone(),
            text,
            increments: self.telemetry.increments(),
            elapsed: self.telemetry.elapsed(),
            time_to_first_text: self.telemetry.time_to_first_text(),
            timed_out: self.timed_out,
        }
    }

    fn wait(&self) -> Wake {
        let limit = match self.cancel.requested_at() {
            Some(at) => Some(at + self.grace),
            None => self.deadline,
        };
        let received = match limit {
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(limit) => self
                .rx
                .recv_timeout(limit.saturating_duration_since(Instant::now())),
        };
        match received {
            Ok(event) => Wake::Event(event),
            Err(RecvTimeoutError::Disconnected) => Wake::Disconnected,
            Err(RecvTimeoutError::Timeout) if self.cancel.is_requested() => Wake::GraceExpired,
            Err(RecvTimeoutError::Timeout) => Wake::DeadlineExpired,
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() && self.error.is_none() {
                self.error = Some(EngineError::Worker("worker thread panicked".to_string()));
            }
        }
    }

    fn complete(&mut self, terminal: TerminalKind) {
        self.join_worker();
        let cancelled = self.cancel.is_requested();
        let (state, reason) = match terminal {
            _ if self.stop_matched => (SessionState::Finished, StopReason::StopToken),
            _ if cancelled => (SessionState::Aborted, StopReason::Cancelled),
            TerminalKind::Finished => (SessionState::Finished, StopReason::MaxLength),
            TerminalKind::Error(code) => {
                self.error = Some(EngineError::Run(code));
                (SessionState::Errored, StopReason::Error)
            }
        };
        self.state = state;
        self.stop_reason = Some(reason);

        let usage = self.telemetry.usage();
        match self.telemetry.perf() {
            Some(perf) => tracing::info!(
                "Run {} {:?}: {} prompt / {} completion tokens, {:.1} tok/s, {:.0} MB",
                self.run,
                reason,
                perf.prefill_tokens,
                perf.generate_tokens,
                perf.generate_tokens_per_second().unwrap_or(0.0),
                perf.memory_usage_mb
            ),
            None => tracing::info!(
                "Run {} {:?} without stats ({:?} completion tokens)",
                self.run,
                reason,
                usage.completion_tokens
            ),
        }
    }

    fn give_up(&mut self) {
        tracing::error!(
            "Run {} ignored abort for {:?}; worker thread leaked inside the native call ({} runs registered)",
            self.run,
            self.grace,
            streaming::active_runs()
        );
        // Detach: the worker still owns the context and frees it when the call returns
        self.worker = None;
        self.error = Some(EngineError::CancellationTimeout {
            run: self.run,
            grace: self.grace,
        });
        self.state = SessionState::Aborted;
        self.stop_reason = Some(if self.stop_matched {
            StopReason::StopToken
        } else {
            StopReason::Cancelled
        });
    }

    fn disconnected(&mut self) {
        self.join_worker();
        if self.error.is_none() {
            self.error = Some(EngineError::Worker(
                "event channel closed before a terminal event".to_string(),
            ));
        }
        self.state = SessionState::Errored;
        self.stop_reason = Some(StopReason::Error);
    }
}

impl Iterator for GenerationStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.is_done() {
            return None;
        }
        loop {
            match self.wait() {
                Wake::Event(StreamEvent::Text(text)) => {
                    if self.stop_matched || self.cancel.is_requested() {
                        tracing::trace!("Run {}: discarding {} bytes after stop", self.run, text.len());
                        continue;
                    }
                    self.telemetry.record_increment();
                    self.text.push_str(&text);
                    if let Some(seq) = self.stops.find_in_tail(&self.text, text.len()) {
                        tracing::debug!("Run {}: stop sequence {:?} matched", self.run, seq);
                        self.stop_matched = true;
                        self.cancel.cancel();
                    }
                    return Some(text);
                }
                Wake::Event(StreamEvent::Waiting) => {
                    tracing::trace!("Run {}: runtime waiting", self.run);
                }
                Wake::Event(StreamEvent::CancelRequested) => {}
                Wake::Event(StreamEvent::Finished(stats)) => {
                    self.telemetry.record_finished(stats);
                    self.complete(TerminalKind::Finished);
                    return None;
                }
                Wake::Event(StreamEvent::Error(code)) => {
                    self.complete(TerminalKind::Error(code));
                    return None;
                }
                Wake::DeadlineExpired => {
                    tracing::warn!("Run {}: timed out, aborting", self.run);
                    self.deadline = None;
                    self.timed_out = self.cancel.cancel();
                }
                Wake::GraceExpired => {
                    self.give_up();
                    return None;
                }
                Wake::Disconnected => {
                    self.disconnected();
                    return None;
                }
            }
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if self.is_done() {
            return;
        }
        tracing::debug!("Run {}: stream dropped while running, cancelling", self.run);
        self.cancel.cancel();
        while self.next().is_some() {}
    }
}

/// Everything the worker thread owns
struct RunJob {
    guard: RunGuard,
    sink: Arc<RunSink>,
    cancel: CancelHandle,
    input: RunInput,
    keep_history: bool,
    transcript: Option<Vec<ChatMessage>>,
    lora_adapter: Option<String>,
    save_prompt_cache: Option<PathBuf>,
    grace: Duration,
}

impl RunJob {
    fn execute(self) {
        let shared = self.guard.shared().clone();
        let run = self.sink.id();
        let request = RunRequest {
            run,
            input: &self.input,
            keep_history: self.keep_history,
            lora_adapter: self.lora_adapter.as_deref(),
            save_prompt_cache: self.save_prompt_cache.as_deref(),
        };

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| shared.backend().run(shared.ctx(), &request)));
        let code = match outcome {
            Ok(Ok(())) => {
                if shared.config().is_async {
                    self.await_terminal();
                }
                MISSING_TERMINAL_CODE
            }
            Ok(Err(e)) => {
                tracing::warn!("Run {}: {}", run, e);
                e.code().unwrap_or(MISSING_TERMINAL_CODE)
            }
            Err(_) => {
                tracing::error!("Run {}: native run panicked", run);
                MISSING_TERMINAL_CODE
            }
        };

        self.sink.close(code);
        streaming::unregister(run);

        let finished_cleanly = self.sink.terminal_kind() == Some(TerminalKind::Finished)
            && !self.cancel.is_requested();
        let history = if !self.keep_history {
            HistoryState::default()
        } else {
            match self.transcript {
                Some(transcript) if finished_cleanly => HistoryState {
                    consumed: transcript.len() + 1,
                    dirty: false,
                    transcript,
                },
                _ => HistoryState {
                    dirty: true,
                    ..shared.history()
                },
            }
        };
        shared.set_history(history);

        self.cancel.settle();
        drop(self.guard);
        tracing::trace!("Run {}: worker done", run);
    }

    /// In async mode `rkllm_run` returns before the callbacks are done
    fn await_terminal(&self) {
        loop {
            if self.sink.wait_terminal(ASYNC_WAIT_SLICE).is_some() {
                return;
            }
            if let Some(at) = self.cancel.requested_at() {
                if at.elapsed() >= self.grace {
                    return;
                }
            }
        }
    }
}

/// Starts a run over a rendered conversation.
///
/// Fails with `SessionBusy`, without touching the runtime, if the engine
/// already has a run in flight.
pub fn start(
    engine: &EngineHandle,
    messages: &[ChatMessage],
    options: GenerationOptions,
) -> Result<GenerationStream, EngineError> {
    if messages.is_empty() {
        return Err(EngineError::InvalidInput("no messages to render".to_string()));
    }
    let guard = engine.shared().try_acquire()?;
    let shared = guard.shared().clone();

    let prompt = if options.keep_history {
        let history = shared.history();
        if history.extended_by(messages) {
            render_continuation(&messages[history.consumed..], options.enable_thinking)
        } else {
            if history.dirty || history.consumed > 0 {
                tracing::debug!("Native history out of sync, re-sending the conversation");
                shared.backend().clear_kv_cache(shared.ctx(), false)?;
                shared.set_history(HistoryState::default());
            }
            render_conversation(messages, &options.tools, options.enable_thinking)
        }
    } else {
        render_conversation(messages, &options.tools, options.enable_thinking)
    };

    let input = RunInput::new(InputPayload::Prompt(prompt))
        .with_role(options.role)
        .with_thinking(options.enable_thinking);
    input.payload.validate().map_err(EngineError::InvalidInput)?;

    launch(guard, input, Some(messages.to_vec()), options)
}

/// Starts a run over a raw payload (tokens, embeddings, multimodal or an
/// already rendered prompt). Role and thinking come from `input`.
pub fn start_input(
    engine: &EngineHandle,
    input: RunInput,
    options: GenerationOptions,
) -> Result<GenerationStream, EngineError> {
    input.payload.validate().map_err(EngineError::InvalidInput)?;
    let guard = engine.shared().try_acquire()?;
    launch(guard, input, None, options)
}

fn launch(
    guard: RunGuard,
    input: RunInput,
    transcript: Option<Vec<ChatMessage>>,
    options: GenerationOptions,
) -> Result<GenerationStream, EngineError> {
    let shared = guard.shared().clone();
    let (tx, rx) = mpsc::channel();
    let sink = streaming::register(tx.clone());
    let run = sink.id();
    let cancel = CancelHandle::new(shared, sink.clone(), tx);

    match &input.payload {
        InputPayload::Prompt(prompt) => tracing::debug!(
            "Run {}: prompt of {} bytes ({:?}...), keep_history={}",
            run,
            prompt.len(),
            truncate_str(prompt, 80),
            options.keep_history
        ),
        other => tracing::debug!(
            "Run {}: {} input, keep_history={}",
            run,
            other.mode(),
            options.keep_history
        ),
    }

    let job = RunJob {
        guard,
        sink,
        cancel: cancel.clone(),
        input,
        keep_history: options.keep_history,
        transcript,
        lora_adapter: options.lora_adapter.clone(),
        save_prompt_cache: options.save_prompt_cache.clone(),
        grace: options.cancel_grace,
    };

    let worker = thread::Builder::new()
        .name(format!("rkllm-run-{}", run))
        .spawn(move || job.execute())
        .map_err(|e| {
            streaming::unregister(run);
            EngineError::Worker(e.to_string())
        })?;

    Ok(GenerationStream {
        run,
        rx,
        cancel,
        worker: Some(worker),
        stops: StopSet::new(options.stop_sequences),
        telemetry: TelemetryAggregator::new(),
        text: String::new(),
        deadline: options.timeout.map(|timeout| Instant::now() + timeout),
        grace: options.cancel_grace,
        stop_matched: false,
        timed_out: false,
        state: SessionState::Running,
        stop_reason: None,
        error: None,
    })
}

impl EngineHandle {
    /// See [`start`]
    pub fn stream(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<GenerationStream, EngineError> {
        start(self, messages, options)
    }

    /// See [`start_input`]
    pub fn stream_input(
        &self,
        input: RunInput,
        options: GenerationOptions,
    ) -> Result<GenerationStream, EngineError> {
        start_input(self, input, options)
    }

    /// Runs to completion and returns the assistant reply
    pub fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<ChatResponse, EngineError> {
        self.stream(messages, options)?.into_response()
    }

    /// Like [`generate`](Self::generate), calling `on_text` for every increment
    pub fn generate_with<F>(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
        mut on_text: F,
    ) -> Result<ChatResponse, EngineError>
    where
        F: FnMut(&str),
    {
        let mut stream = self.stream(messages, options)?;
        for text in stream.by_ref() {
            on_text(&text);
        }
        stream.into_response()
    }
}
