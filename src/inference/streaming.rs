//! Callback event channel
//!
//! Native callbacks run synchronously on the worker thread, inside the vendor's
//! call stack. They are routed by run id to a per-run [`RunSink`], which
//! reassembles text and enqueues [`StreamEvent`]s on an unbounded channel that
//! the consumer drains. Enqueueing never blocks and never drops a terminal
//! event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::inference::telemetry::PerfStats;
use crate::inference::utf8::ByteReassembler;

/// Identity of one run, carried through the native `userdata` pointer
pub type RunId = u64;

/// Status code used when a run ends without the runtime reporting a terminal state
pub const MISSING_TERMINAL_CODE: i32 = -1;

/// A raw notification from the native runtime
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    /// Raw text bytes, possibly ending in the middle of a code point
    TokenChunk(Vec<u8>),
    /// The runtime is waiting (e.g. for more input in async mode)
    Waiting,
    /// Generation finished; carries the run's counters
    Finished(PerfStats),
    /// The runtime reported an error state
    Error(i32),
}

impl CallbackEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallbackEvent::Finished(_) | CallbackEvent::Error(_))
    }
}

/// An event as seen by the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded, complete text fragment
    Text(String),
    /// The runtime reported a waiting state
    Waiting,
    /// Generation completed
    Finished(PerfStats),
    /// Generation failed with a native status code
    Error(i32),
    /// Someone asked for cancellation; wakes a consumer blocked on the channel
    CancelRequested,
}

impl StreamEvent {
    /// Returns true if this is a text variant
    pub fn is_text(&self) -> bool {
        matches!(self, StreamEvent::Text(_))
    }

    /// Returns true if this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished(_) | StreamEvent::Error(_))
    }

    /// Extracts the text if this is a Text variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamEvent::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// How a run terminated, as observed by its sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Finished,
    Error(i32),
}

/// Producer side of one run
pub struct RunSink {
    id: RunId,
    tx: Sender<StreamEvent>,
    reassembler: Mutex<ByteReassembler>,
    terminal: Mutex<Option<TerminalKind>>,
    terminated: Condvar,
}

impl RunSink {
    fn new(id: RunId, tx: Sender<StreamEvent>) -> Self {
        Self {
            id,
            tx,
            reassembler: Mutex::new(ByteReassembler::new()),
            terminal: Mutex::new(None),
            terminated: Condvar::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Handles one native event. Called from inside the native callback.
    pub fn deliver(&self, event: CallbackEvent) {
        let mut terminal = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if terminal.is_some() {
            tracing::debug!("Run {}: dropping {:?} after terminal event", self.id, event);
            return;
        }

        let stream_event = match event {
            CallbackEvent::TokenChunk(bytes) => {
                let text = self.with_reassembler(|r| r.push(&bytes));
                if text.is_empty() {
                    return;
                }
                StreamEvent::Text(text)
            }
            CallbackEvent::Waiting => StreamEvent::Waiting,
            CallbackEvent::Finished(stats) => {
                self.flush_carry();
                *terminal = Some(TerminalKind::Finished);
                StreamEvent::Finished(stats)
            }
            CallbackEvent::Error(code) => {
                self.flush_carry();
                *terminal = Some(TerminalKind::Error(code));
                StreamEvent::Error(code)
            }
        };

        let is_terminal = stream_event.is_terminal();
        if self.tx.send(stream_event).is_err() {
            tracing::trace!("Run {}: consumer gone, event discarded", self.id);
        }
        if is_terminal {
            self.terminated.notify_all();
        }
    }

    /// Emits a terminal error if the runtime returned without sending one
    pub fn close(&self, code: i32) {
        if self.terminal_kind().is_none() {
            tracing::warn!(
                "Run {}: native run returned without a terminal event (status {})",
                self.id,
                code
            );
            self.deliver(CallbackEvent::Error(code));
        }
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self.terminal.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Blocks until a terminal event was delivered or `timeout` elapsed
    pub fn wait_terminal(&self, timeout: Duration) -> Option<TerminalKind> {
        let guard = match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match self
            .terminated
            .wait_timeout_while(guard, timeout, |terminal| terminal.is_none())
        {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }

    fn with_reassembler<T>(&self, f: impl FnOnce(&mut ByteReassembler) -> T) -> T {
        match self.reassembler.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn flush_carry(&self) {
        if let Err(e) = self.with_reassembler(|r| r.finish()) {
            tracing::warn!("Run {}: {}", self.id, e);
        }
    }
}

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Live runs keyed by id. The native callback is registered once per library
/// load, so this table is what separates concurrent engines.
static RUNS: Lazy<DashMap<RunId, Arc<RunSink>>> = Lazy::new(DashMap::new);

/// Allocates a run id and makes it reachable from [`dispatch`]
pub fn register(tx: Sender<StreamEvent>) -> Arc<RunSink> {
    let id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
    let sink = Arc::new(RunSink::new(id, tx));
    RUNS.insert(id, sink.clone());
    tracing::trace!("Registered run {}", id);
    sink
}

/// Removes a run; later callbacks for it are dropped
pub fn unregister(id: RunId) {
    RUNS.remove(&id);
    tracing::trace!("Unregistered run {}", id);
}

/// Routes a native event to its run. Returns false if the run is unknown.
pub fn dispatch(run: RunId, event: CallbackEvent) -> bool {
    let sink = RUNS.get(&run).map(|entry| entry.value().clone());
    match sink {
        Some(sink) => {
            sink.deliver(event);
            true
        }
        None => {
            tracing::warn!("Dropping {:?} for unknown run {}", event, run);
            false
        }
    }
}

/// Number of runs currently registered
pub fn active_runs() -> usize {
    RUNS.len()
}
