//! Frequency plan for a sweep.
//!
//! Points are spaced logarithmically between the start and end frequency. The quality
//! level decides how many points each decade gets and how many acquisitions are averaged
//! per point; [`quality_profile`] is the single place that mapping lives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-facing resolution/time trade-off, 1 (fast) to 10 (fine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    /// Lowest quality level
    pub const MIN: Quality = Quality(1);
    /// Highest quality level
    pub const MAX: Quality = Quality(10);

    /// Quality `level`; `None` outside 1..=10.
    pub fn new(level: u8) -> Option<Self> {
        (Self::MIN.0..=Self::MAX.0)
            .contains(&level)
            .then_some(Self(level))
    }

    /// Numeric level
    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<u8> for Quality {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Quality::new(level).ok_or_else(|| format!("quality must be 1-10, got {}", level))
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> u8 {
        quality.0
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acquisition effort derived from a quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    /// Frequency points per decade
    pub points_per_decade: usize,
    /// Acquisitions averaged per frequency point
    pub repeats: usize,
}

/// Map a quality level to sweep density and averaging.
///
/// Quality 1 gives 9 points per decade, matching the 1-2-...-9 steps a bench operator
/// would dial in by hand. Both values are non-decreasing in the level.
pub fn quality_profile(quality: Quality) -> QualityProfile {
    let level = usize::from(quality.level());
    QualityProfile {
        points_per_decade: 9 * level,
        repeats: 1 + level / 4,
    }
}

/// Reasons a plan cannot be built
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// Start is not below end
    #[error("start frequency {start} Hz must be below end frequency {end} Hz")]
    EmptyRange {
        /// Requested start frequency
        start: f64,
        /// Requested end frequency
        end: f64,
    },

    /// Start or end is zero, negative or not finite
    #[error("frequencies must be positive and finite, got {0} Hz")]
    InvalidFrequency(f64),

    /// Range too wide to plan at this quality
    #[error("{start} Hz to {end} Hz needs more than {limit} points")]
    TooManyPoints {
        /// Requested start frequency
        start: f64,
        /// Requested end frequency
        end: f64,
        /// [`MAX_POINTS`]
        limit: usize,
    },
}

/// Upper bound on the number of points in one plan
pub const MAX_POINTS: usize = 10_000;

/// Strictly increasing, log-spaced list of sweep frequencies.
///
/// The first entry is exactly the start frequency and the last exactly the end frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    frequencies: Vec<f64>,
}

impl SweepPlan {
    /// Build the plan for `start_hz..=end_hz` at `quality`.
    pub fn new(start_hz: f64, end_hz: f64, quality: Quality) -> Result<Self, PlanError> {
        for f in [start_hz, end_hz] {
            if !f.is_finite() || f <= 0.0 {
                return Err(PlanError::InvalidFrequency(f));
            }
        }
        if start_hz >= end_hz {
            return Err(PlanError::EmptyRange {
                start: start_hz,
                end: end_hz,
            });
        }

        let decades = (end_hz / start_hz).log10();
        let per_decade = quality_profile(quality).points_per_decade as f64;
        // Tolerate log10 rounding so exact decades do not gain a point
        let intervals = (decades * per_decade - 1e-9).ceil();
        if intervals.is_nan() || intervals >= MAX_POINTS as f64 {
            return Err(PlanError::TooManyPoints {
                start: start_hz,
                end: end_hz,
                limit: MAX_POINTS,
            });
        }
        let intervals = (intervals as usize).max(1);

        let mut frequencies = Vec::with_capacity(intervals + 1);
        frequencies.push(start_hz);
        for i in 1..intervals {
            let f = start_hz * 10f64.powf(decades * i as f64 / intervals as f64);
            if f > *frequencies.last().unwrap_or(&start_hz) && f < end_hz {
                frequencies.push(f);
            }
        }
        frequencies.push(end_hz);

        Ok(Self { frequencies })
    }

    /// Planned frequencies in sweep order
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    /// Always false; a plan has at least its two end points.
    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Iterate over planned frequencies.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.frequencies.iter().copied()
    }
}
