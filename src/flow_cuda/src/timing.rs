//! Per-call timing instrumentation.
//!
//! Timing is only collected when the `profiling` feature is enabled.
//! Without the feature the collector and [`time_phase!`] compile to no-ops
//! and every reported duration is zero.

use serde::{Deserialize, Serialize};
#[cfg(feature = "profiling")]
use std::time::Instant;

pub const PHASE_GEOMETRY: &str = "geometry";
pub const PHASE_MATCH: &str = "match";
pub const PHASE_TRANSFER: &str = "transfer";

/// Timing breakdown for one forward or backward call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowTiming {
    pub total_ms: f64,
    /// Back-projection. Always zero for the backward pass, which takes
    /// points that are already decoded.
    pub geometry_ms: f64,
    /// Nearest-neighbor search.
    pub match_ms: f64,
    /// Data copy (forward) or gradient gather (backward).
    pub transfer_ms: f64,
}

/// Wall-clock timer for one [`time_phase!`] block.
#[cfg(feature = "profiling")]
pub struct Timer(Instant);

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn start() -> Self {
        Self(Instant::now())
    }

    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    start: Option<Instant>,
    timing: FlowTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.timing = FlowTiming::default();
    }

    pub fn record_phase(&mut self, phase: &str, duration_ms: f64) {
        match phase {
            PHASE_GEOMETRY => self.timing.geometry_ms += duration_ms,
            PHASE_MATCH => self.timing.match_ms += duration_ms,
            PHASE_TRANSFER => self.timing.transfer_ms += duration_ms,
            _ => {}
        }
    }

    pub fn finish(&mut self) -> FlowTiming {
        self.timing.total_ms = self
            .start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start(&mut self) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: &str, _duration_ms: f64) {}

    #[inline(always)]
    pub fn finish(&mut self) -> FlowTiming {
        FlowTiming::default()
    }
}

/// Time a block and record it under `$phase`.
///
/// ```ignore
/// let matches = time_phase!(collector, PHASE_MATCH, {
///     compute_matches(&previous, &current, &params, strategy)
/// });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let _timer = $crate::timing::Timer::start();

        let result = $block;

        #[cfg(feature = "profiling")]
        $collector.record_phase($phase, _timer.elapsed_ms());

        result
    }};
}
