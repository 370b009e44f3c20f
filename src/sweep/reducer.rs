//! Reduction of raw oscilloscope readings into Bode samples.

use crate::error::{InstrumentError, InstrumentResult};
use serde::{Deserialize, Serialize};

/// One acquisition at one frequency, with probe attenuation already applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    /// Peak-to-peak voltage at the DUT input
    pub vpp_in: f64,
    /// Peak-to-peak voltage at the DUT output
    pub vpp_out: f64,
    /// Phase of output relative to input as reported, nominally `[-90, 270)`
    pub raw_phase_deg: f64,
}

impl RawReading {
    /// Scale both voltages by their probe attenuation factors.
    pub fn attenuated(self, in_factor: f64, out_factor: f64) -> Self {
        Self {
            vpp_in: self.vpp_in * in_factor,
            vpp_out: self.vpp_out * out_factor,
            ..self
        }
    }
}

/// One point of the frequency response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Stimulus frequency
    pub frequency_hz: f64,
    /// Peak-to-peak voltage at the DUT input
    pub vpp_in: f64,
    /// Peak-to-peak voltage at the DUT output
    pub vpp_out: f64,
    /// `20 * log10(vpp_out / vpp_in)`
    pub gain_db: f64,
    /// Phase in `[-180, 180)`
    pub phase_deg: f64,
}

/// Map any angle into `[-180, 180)`.
///
/// On the oscilloscope's `[-90, 270)` range this subtracts 360 from values at or above 180
/// and leaves the rest unchanged.
pub fn normalize_phase(degrees: f64) -> f64 {
    (degrees + 180.0).rem_euclid(360.0) - 180.0
}

/// Gain in dB of `vpp_out` relative to `vpp_in`.
pub fn gain_db(vpp_in: f64, vpp_out: f64) -> InstrumentResult<f64> {
    for (name, v) in [("input", vpp_in), ("output", vpp_out)] {
        if !v.is_finite() || v <= 0.0 {
            return Err(InstrumentError::InvalidReading(format!(
                "{} Vpp {} is not positive",
                name, v
            )));
        }
    }
    Ok(20.0 * (vpp_out / vpp_in).log10())
}

/// Reduce a single reading taken at `frequency_hz`.
pub fn reduce(frequency_hz: f64, reading: RawReading) -> InstrumentResult<MeasurementSample> {
    reduce_many(frequency_hz, std::slice::from_ref(&reading))
}

/// Reduce several readings taken at `frequency_hz` into one sample.
///
/// Voltages are averaged arithmetically. Phases are averaged as unit vectors so that
/// readings either side of the +/-180 wrap do not cancel out to zero.
pub fn reduce_many(frequency_hz: f64, readings: &[RawReading]) -> InstrumentResult<MeasurementSample> {
    if readings.is_empty() {
        return Err(InstrumentError::InvalidReading(format!(
            "no readings at {} Hz",
            frequency_hz
        )));
    }

    for r in readings {
        gain_db(r.vpp_in, r.vpp_out)?;
        if !r.raw_phase_deg.is_finite() {
            return Err(InstrumentError::InvalidReading(format!(
                "phase {} is not finite",
                r.raw_phase_deg
            )));
        }
    }

    let n = readings.len() as f64;
    let vpp_in = readings.iter().map(|r| r.vpp_in).sum::<f64>() / n;
    let vpp_out = readings.iter().map(|r| r.vpp_out).sum::<f64>() / n;

    let phase_deg = if readings.len() == 1 {
        normalize_phase(readings[0].raw_phase_deg)
    } else {
        circular_mean_deg(readings.iter().map(|r| r.raw_phase_deg))
    };

    Ok(MeasurementSample {
        frequency_hz,
        vpp_in,
        vpp_out,
        gain_db: gain_db(vpp_in, vpp_out)?,
        phase_deg,
    })
}

fn circular_mean_deg(angles: impl Iterator<Item = f64>) -> f64 {
    let (sin, cos) = angles.fold((0.0, 0.0), |(s, c), deg: f64| {
        let rad = deg.to_radians();
        (s + rad.sin(), c + rad.cos())
    });
    normalize_phase(sin.atan2(cos).to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn reading(vpp_in: f64, vpp_out: f64, phase: f64) -> RawReading {
        RawReading {
            vpp_in,
            vpp_out,
            raw_phase_deg: phase,
        }
    }

    #[test]
    fn test_half_amplitude_is_minus_6db() {
        let sample = reduce(1000.0, reading(1.0, 0.5, 0.0)).unwrap();
        assert!((sample.gain_db - -6.0206).abs() < 1e-4);
        assert_eq!(sample.frequency_hz, 1000.0);
    }

    #[test]
    fn test_unity_gain() {
        let sample = reduce(1000.0, reading(0.7, 0.7, 10.0)).unwrap();
        assert_eq!(sample.gain_db, 0.0);
        assert_eq!(sample.phase_deg, 10.0);
    }

    #[test]
    fn test_zero_vpp_is_invalid() {
        for r in [reading(0.0, 1.0, 0.0), reading(1.0, 0.0, 0.0), reading(-1.0, 1.0, 0.0)] {
            assert!(matches!(
                reduce(1000.0, r),
                Err(InstrumentError::InvalidReading(_))
            ));
        }
    }

    #[test]
    fn test_phase_normalization_on_scope_range() {
        assert_eq!(normalize_phase(240.0), -120.0);
        assert_eq!(normalize_phase(180.0), -180.0);
        assert_eq!(normalize_phase(179.5), 179.5);
        assert_eq!(normalize_phase(-90.0), -90.0);
        assert_eq!(normalize_phase(0.0), 0.0);

        let mut raw = -90.0;
        while raw < 270.0 {
            let p = normalize_phase(raw);
            assert!((-180.0..180.0).contains(&p), "{} -> {}", raw, p);
            let back = if p < -90.0 { p + 360.0 } else { p };
            assert!((back - raw).abs() < EPS, "{} -> {} -> {}", raw, p, back);
            raw += 0.25;
        }
    }

    #[test]
    fn test_attenuation_scales_before_gain() {
        let r = reading(2.0, 2.0, 0.0).attenuated(10.0, 1.0);
        assert_eq!(r.vpp_in, 20.0);
        let sample = reduce(1000.0, r).unwrap();
        assert!((sample.gain_db - -20.0).abs() < EPS);
        assert_eq!(sample.vpp_in, 20.0);
    }

    #[test]
    fn test_circular_phase_average_across_wrap() {
        // 179 and 181 (reported) straddle the wrap; arithmetic mean of the normalized
        // values would give 0.
        let readings = [reading(1.0, 1.0, 179.0), reading(1.0, 1.0, 181.0)];
        let sample = reduce_many(1000.0, &readings).unwrap();
        assert!((sample.phase_deg.abs() - 180.0).abs() < 1e-6, "{}", sample.phase_deg);
        assert!((-180.0..180.0).contains(&sample.phase_deg));
    }

    #[test]
    fn test_average_vpp_arithmetic() {
        let readings = [reading(1.0, 0.4, -10.0), reading(1.0, 0.6, -20.0)];
        let sample = reduce_many(1000.0, &readings).unwrap();
        assert!((sample.vpp_out - 0.5).abs() < EPS);
        assert!((sample.gain_db - 20.0 * 0.5f64.log10()).abs() < EPS);
        assert!((sample.phase_deg - -15.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_readings() {
        assert!(reduce_many(1000.0, &[]).is_err());
    }
}
