//! Run telemetry
//!
//! The native runtime reports performance counters exactly once per run, inside
//! the terminal `Finished` callback. Until then every figure is unknown.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Performance counters reported by the runtime when a run finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    /// Time spent on the prompt (prefill) phase in milliseconds
    pub prefill_time_ms: f32,
    /// Number of prompt tokens processed
    pub prefill_tokens: u32,
    /// Time spent generating in milliseconds
    pub generate_time_ms: f32,
    /// Number of generated tokens
    pub generate_tokens: u32,
    /// Memory used by the runtime in megabytes
    pub memory_usage_mb: f32,
}

impl PerfStats {
    /// Generation throughput, if the runtime reported a non-zero duration
    pub fn generate_tokens_per_second(&self) -> Option<f32> {
        if self.generate_time_ms > 0.0 {
            Some(self.generate_tokens as f32 * 1000.0 / self.generate_time_ms)
        } else {
            None
        }
    }

    /// Prefill throughput, if the runtime reported a non-zero duration
    pub fn prefill_tokens_per_second(&self) -> Option<f32> {
        if self.prefill_time_ms > 0.0 {
            Some(self.prefill_tokens as f32 * 1000.0 / self.prefill_time_ms)
        } else {
            None
        }
    }
}

/// Token counts exposed to callers; `None` means the run never reported them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> Option<u32> {
        Some(self.prompt_tokens? + self.completion_tokens?)
    }
}

impl From<&PerfStats> for TokenUsage {
    fn from(stats: &PerfStats) -> Self {
        Self {
            prompt_tokens: Some(stats.prefill_tokens),
            completion_tokens: Some(stats.generate_tokens),
        }
    }
}

/// Collects telemetry for one run on the consumer side
#[derive(Debug)]
pub struct TelemetryAggregator {
    started: Instant,
    first_text: Option<Duration>,
    increments: usize,
    perf: Option<PerfStats>,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            first_text: None,
            increments: 0,
            perf: None,
        }
    }

    /// Notes that a text increment reached the consumer
    pub fn record_increment(&mut self) {
        if self.first_text.is_none() {
            self.first_text = Some(self.started.elapsed());
        }
        self.increments += 1;
    }

    /// Stores the counters from the terminal `Finished` event
    pub fn record_finished(&mut self, stats: PerfStats) {
        self.perf = Some(stats);
    }

    pub fn perf(&self) -> Option<PerfStats> {
        self.perf
    }

    pub fn usage(&self) -> TokenUsage {
        self.perf.as_ref().map(TokenUsage::from).unwrap_or_default()
    }

    pub fn increments(&self) -> usize {
        self.increments
    }

    pub fn time_to_first_text(&self) -> Option<Duration> {
        self.first_text
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new()
    }
}
