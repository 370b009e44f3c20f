//! Error types for the sweep engine.
//!
//! Faults are layered the same way the acquisition is:
//!
//! - **`InstrumentError`**: a single exchange with one instrument went wrong. This covers
//!   transport timeouts, responses larger than the instrument can produce safely,
//!   responses that do not decode, and numbers that make no physical sense.
//! - **`MeasurementFault`**: an `InstrumentError` raised while measuring, tagged with the
//!   frequency of the sweep point that was being measured.
//! - **`EngineFault`**: the sweep as a whole stopped. It always carries the samples
//!   collected before the fault so a partial Bode curve can still be inspected.
//!
//! None of these are retried automatically. Once the oscilloscope's command interpreter
//! is confused it tends to stay confused, and a retried query is more likely to return
//! a stale answer than a correct one.

use crate::sweep::SweepResult;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results of single instrument exchanges.
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// Failure of a single command/response exchange.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// No response arrived in time
    #[error("no response to '{query}' within {timeout:?}")]
    ProtocolTimeout {
        /// Command or query that went unanswered
        query: String,
        /// How long the channel waited
        timeout: Duration,
    },

    /// Response longer than the instrument can deliver intact
    #[error("response to '{query}' is {len} bytes, limit is {limit}")]
    BufferOverflow {
        /// Query that produced the response
        query: String,
        /// Response length in bytes
        len: usize,
        /// Length at which responses are rejected
        limit: usize,
    },

    /// Response does not have the expected form
    #[error("cannot decode response to '{query}': {reason}")]
    DecodeFault {
        /// Query that produced the response
        query: String,
        /// What did not match
        reason: String,
    },

    /// Physically meaningless value, or `****`
    #[error("invalid reading: {0}")]
    InvalidReading(String),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection
    #[error("instrument connection closed")]
    Closed,
}

impl InstrumentError {
    pub(crate) fn decode(query: &str, reason: impl Into<String>) -> Self {
        InstrumentError::DecodeFault {
            query: query.to_string(),
            reason: reason.into(),
        }
    }
}

/// An instrument fault raised while measuring one sweep point.
#[derive(Error, Debug)]
#[error("measurement failed at {frequency_hz} Hz: {source}")]
pub struct MeasurementFault {
    /// Generator frequency of the point being measured
    pub frequency_hz: f64,
    /// Underlying instrument failure
    #[source]
    pub source: InstrumentError,
}

/// Reason a sweep stopped before completing its plan.
#[derive(Error, Debug)]
pub enum EngineFaultKind {
    /// A point could not be measured and the fault policy is abort
    #[error(transparent)]
    Measurement(#[from] MeasurementFault),

    /// The generator did not accept a frequency step
    #[error("generator failed at {frequency_hz} Hz: {source}")]
    Generator {
        /// Frequency that was being set
        frequency_hz: f64,
        /// Underlying generator failure
        #[source]
        source: InstrumentError,
    },

    /// Instrument preparation failed before the first point
    #[error("instrument setup failed: {0}")]
    Setup(#[source] InstrumentError),

    /// Cancelled by the operator
    #[error("sweep cancelled after {completed} points")]
    Cancelled {
        /// Points fully measured before the cancellation
        completed: usize,
    },

    /// Sweep parameters rejected before any instrument was touched
    #[error("invalid sweep configuration: {0}")]
    InvalidConfig(String),
}

/// Sweep-level failure carrying the samples collected before it happened.
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct EngineFault {
    /// What went wrong
    pub kind: EngineFaultKind,
    /// Samples acquired before the fault, in plan order
    pub partial: SweepResult,
}

impl EngineFault {
    /// Create a fault with the partial result collected so far.
    pub fn new(kind: impl Into<EngineFaultKind>, partial: SweepResult) -> Self {
        Self {
            kind: kind.into(),
            partial,
        }
    }

    /// Frequency of the sweep point that failed, if the fault belongs to one.
    pub fn frequency_hz(&self) -> Option<f64> {
        match &self.kind {
            EngineFaultKind::Measurement(fault) => Some(fault.frequency_hz),
            EngineFaultKind::Generator { frequency_hz, .. } => Some(*frequency_hz),
            _ => None,
        }
    }

    /// True when the sweep stopped because the operator cancelled it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, EngineFaultKind::Cancelled { .. })
    }
}
