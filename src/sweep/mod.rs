//! Sweep-and-measure engine.
//!
//! - [`plan`]: log-spaced frequency plan and the quality mapping
//! - [`reducer`]: raw readings to gain/phase samples
//! - [`engine`]: the scheduler that drives generator and oscilloscope through the plan
//!
//! # State Machine
//!
//! ```text
//! Idle ─> Planning ─> Stepping ─> Settling ─> Measuring ─> Advancing ─> Done
//!                        ▲                        │            │
//!                        └────────────────────────┼────────────┘
//!                                                 ▼
//!                                              Aborted
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

pub mod engine;
pub mod plan;
pub mod reducer;

pub use engine::{run_sweep, FaultPolicy, SweepConfig, SweepEngine};
pub use plan::{quality_profile, PlanError, Quality, QualityProfile, SweepPlan};
pub use reducer::{gain_db, normalize_phase, reduce, reduce_many, MeasurementSample, RawReading};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Not started
    Idle,
    /// Computing the frequency plan and preparing instruments
    Planning,
    /// Setting the generator to the next frequency
    Stepping,
    /// Waiting for the measurement to converge
    Settling,
    /// Reading the oscilloscope
    Measuring,
    /// Moving to the next frequency
    Advancing,
    /// Every planned point was visited
    Done,
    /// Stopped by a fault or cancellation
    Aborted,
}

impl SweepState {
    /// True for `Done` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SweepState::Done | SweepState::Aborted)
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepState::Idle => "Idle",
            SweepState::Planning => "Planning",
            SweepState::Stepping => "Stepping",
            SweepState::Settling => "Settling",
            SweepState::Measuring => "Measuring",
            SweepState::Advancing => "Advancing",
            SweepState::Done => "Done",
            SweepState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Samples produced by a sweep, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepResult {
    /// One sample per successfully measured plan entry, increasing in frequency
    pub samples: Vec<MeasurementSample>,
    /// Frequencies skipped under [`FaultPolicy::Skip`]
    pub skipped: Vec<f64>,
}

impl SweepResult {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no sample was collected
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate over samples.
    pub fn iter(&self) -> std::slice::Iter<'_, MeasurementSample> {
        self.samples.iter()
    }

    /// Frequencies of the collected samples
    pub fn frequencies(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.frequency_hz).collect()
    }
}

impl<'a> IntoIterator for &'a SweepResult {
    type Item = &'a MeasurementSample;
    type IntoIter = std::slice::Iter<'a, MeasurementSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Wait primitive used for settle delays.
#[async_trait]
pub trait Timer: Send + Sync {
    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// [`Timer`] backed by `tokio::time::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Requests cancellation of a running sweep.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Ask the sweep to stop at the next step boundary.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the engine between steps.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a connected handle/token pair.
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::pair().1
    }

    /// True once [`CancelHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
