//! Cancellation controller
//!
//! A [`CancelHandle`] turns an external request (user interrupt, timeout,
//! stop-sequence match) into exactly one native abort for its run, and pushes
//! a wake-up event so a consumer blocked on the channel re-checks its state.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::inference::engine::EngineShared;
use crate::inference::streaming::{RunId, RunSink, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelPhase {
    Live,
    Requested(Instant),
    /// The run is over; cancelling is a no-op
    Settled,
}

struct CancelInner {
    phase: CancelPhase,
    /// Dropped on settle so the channel disconnects once the worker is gone
    wake: Option<Sender<StreamEvent>>,
}

struct CancelState {
    run: RunId,
    engine: Arc<EngineShared>,
    /// Knows whether the runtime already reported the end of the run. Weak so
    /// the channel still disconnects once the worker drops its sink.
    sink: Weak<RunSink>,
    inner: Mutex<CancelInner>,
}

/// Cloneable, thread-safe cancel switch for one run
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        sink: Arc<RunSink>,
        wake: Sender<StreamEvent>,
    ) -> Self {
        Self {
            state: Arc::new(CancelState {
                run: sink.id(),
                engine,
                sink: Arc::downgrade(&sink),
                inner: Mutex::new(CancelInner {
                    phase: CancelPhase::Live,
                    wake: Some(wake),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancelInner> {
        match self.state.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.state.run
    }

    /// Requests cancellation. Returns true if this call issued the abort.
    ///
    /// Repeated calls, and calls after the run ended, do nothing.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.phase != CancelPhase::Live {
            return false;
        }
        let terminal = match self.state.sink.upgrade() {
            Some(sink) => sink.terminal_kind(),
            None => return false,
        };
        // The terminal event is in; the worker is only winding down
        if let Some(terminal) = terminal {
            tracing::debug!(
                "Run {}: already ended ({:?}), nothing to cancel",
                self.state.run,
                terminal
            );
            return false;
        }

        // Under the lock: settle() cannot release the context mid-abort
        if let Err(e) = self.state.engine.abort_native() {
            tracing::warn!("Run {}: abort failed: {}", self.state.run, e);
        }
        inner.phase = CancelPhase::Requested(Instant::now());
        if let Some(wake) = &inner.wake {
            let _ = wake.send(StreamEvent::CancelRequested);
        }
        tracing::debug!("Run {}: cancellation requested", self.state.run);
        true
    }

    pub fn is_requested(&self) -> bool {
        matches!(self.lock().phase, CancelPhase::Requested(_))
    }

    /// When the abort was issued, if it was
    pub fn requested_at(&self) -> Option<Instant> {
        match self.lock().phase {
            CancelPhase::Requested(at) => Some(at),
            _ => None,
        }
    }

    /// Returns true once the run's worker has let go of the context
    pub fn is_settled(&self) -> bool {
        self.lock().phase == CancelPhase::Settled
    }

    /// Called by the worker after the native run returned, before the context
    /// is released for the next run.
    pub(crate) fn settle(&self) {
        let mut inner = self.lock();
        inner.wake = None;
        // A requested cancel stays visible to the consumer
        if inner.phase == CancelPhase::Live {
            inner.phase = CancelPhase::Settled;
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("run", &self.state.run)
            .field("phase", &self.lock().phase)
            .finish()
    }
}
