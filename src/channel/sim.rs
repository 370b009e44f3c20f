//! Simulated generator/oscilloscope pair
//!
//! `SimulatedBench` stands in for a real bench with a low-pass RC filter between the
//! generator output and the oscilloscope probes. Both instruments share one state: the
//! frequency, amplitude and output state set on the generator determine what the
//! oscilloscope measures.
//!
//! The simulated oscilloscope answers like the real one does, including the `0xA1 0xE3`
//! trailer on phase responses, `****` for measurements it cannot make and phase values
//! in `[-90, 270)`. Probes are modelled as dividers of `probe_ratio`, so readings only
//! come out right when the sweep applies the matching attenuation.

use super::{CallLog, InstrumentChannel};
use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Response timeout reported by injected failures
const SIM_TIMEOUT: Duration = Duration::from_millis(2000);

/// Sample rate reported by the simulated oscilloscope
const SIM_SAMPLE_RATE: &str = "SARA 1.00E+09Sa/s";

#[derive(Debug)]
struct BenchState {
    cutoff_hz: f64,
    order: u32,
    probe_ratio: f64,
    awg_output: u8,
    in_channel: u8,
    out_channel: u8,
    frequency_hz: f64,
    amplitude_vpp: f64,
    output_on: bool,
    frequency_changes: usize,
    fail_at_point: Option<usize>,
}

impl BenchState {
    fn ratio(&self) -> f64 {
        let x = self.frequency_hz / self.cutoff_hz;
        (1.0 / (1.0 + x * x).sqrt()).powi(self.order as i32)
    }

    /// Output phase relative to input, as the oscilloscope reports it.
    fn reported_phase(&self) -> f64 {
        let lag = -(self.order as f64) * (self.frequency_hz / self.cutoff_hz).atan().to_degrees();
        if lag < -90.0 {
            lag + 360.0
        } else {
            lag
        }
    }

    fn vpp_at(&self, channel: u8) -> Option<f64> {
        if !self.output_on {
            return None;
        }
        let at_probe = if channel == self.in_channel {
            self.amplitude_vpp
        } else if channel == self.out_channel {
            self.amplitude_vpp * self.ratio()
        } else {
            return None;
        };
        Some(at_probe / self.probe_ratio)
    }

    fn failing(&self) -> bool {
        self.fail_at_point == Some(self.frequency_changes)
    }
}

/// Generator and oscilloscope wired to a simulated low-pass filter
///
/// # Example
///
/// ```
/// use bode_sweep::channel::SimulatedBench;
/// use bode_sweep::sweep::{run_sweep, CancelToken, SweepConfig};
///
/// # tokio_test::block_on(async {
/// let bench = SimulatedBench::new(10_000.0);
/// let config = SweepConfig { autoscale: false, ..SweepConfig::default() };
/// let result = run_sweep(bench.generator(), bench.scope(), config, CancelToken::never())
///     .await
///     .unwrap();
/// assert!(result.iter().last().unwrap().gain_db < -15.0);
/// # })
/// ```
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    awg_log: CallLog,
    scope_log: CallLog,
}

impl SimulatedBench {
    /// First-order low-pass with `cutoff_hz`, 10:1 probes on C1 (input) and C2 (output),
    /// driven by generator output C1.
    pub fn new(cutoff_hz: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                cutoff_hz,
                order: 1,
                probe_ratio: 10.0,
                awg_output: 1,
                in_channel: 1,
                out_channel: 2,
                frequency_hz: 1000.0,
                amplitude_vpp: 1.0,
                output_on: false,
                frequency_changes: 0,
                fail_at_point: None,
            })),
            awg_log: CallLog::default(),
            scope_log: CallLog::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BenchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of cascaded RC stages (clamped to 1..=2).
    pub fn with_order(self, order: u32) -> Self {
        self.lock().order = order.clamp(1, 2);
        self
    }

    /// Division ratio of both probes.
    pub fn with_probe_ratio(self, ratio: f64) -> Self {
        self.lock().probe_ratio = ratio;
        self
    }

    /// Which generator output drives the filter and which scope channels probe it.
    pub fn with_wiring(self, awg_output: u8, in_channel: u8, out_channel: u8) -> Self {
        {
            let mut state = self.lock();
            state.awg_output = awg_output;
            state.in_channel = in_channel;
            state.out_channel = out_channel;
        }
        self
    }

    /// Make Vpp queries time out after the `n`-th frequency change (1-based).
    pub fn fail_at_point(self, n: usize) -> Self {
        self.lock().fail_at_point = Some(n);
        self
    }

    /// Channel to the simulated generator.
    pub fn generator(&self) -> SimGenerator {
        SimGenerator {
            bench: self.clone(),
        }
    }

    /// Channel to the simulated oscilloscope.
    pub fn scope(&self) -> SimScope {
        SimScope {
            bench: self.clone(),
        }
    }

    /// Commands and queries received by the generator.
    pub fn generator_log(&self) -> CallLog {
        self.awg_log.clone()
    }

    /// Commands and queries received by the oscilloscope.
    pub fn scope_log(&self) -> CallLog {
        self.scope_log.clone()
    }

    /// Expected gain in dB at `frequency_hz`.
    pub fn expected_gain_db(&self, frequency_hz: f64) -> f64 {
        let state = self.lock();
        let x = frequency_hz / state.cutoff_hz;
        -10.0 * f64::from(state.order) * (1.0 + x * x).log10()
    }

    /// Expected phase in degrees at `frequency_hz`, in `[-180, 180)`.
    pub fn expected_phase_deg(&self, frequency_hz: f64) -> f64 {
        let state = self.lock();
        -(state.order as f64) * (frequency_hz / state.cutoff_hz).atan().to_degrees()
    }
}

fn timeout(query: &str) -> InstrumentError {
    InstrumentError::ProtocolTimeout {
        query: query.to_string(),
        timeout: SIM_TIMEOUT,
    }
}

fn parse_number(command: &str, text: &str) -> InstrumentResult<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| InstrumentError::decode(command, format!("'{}': {}", text, e)))
}

/// Split `C<n>:<rest>` into the channel number and the rest.
fn split_channel(command: &str) -> Option<(u8, &str)> {
    let rest = command.strip_prefix('C')?;
    let (digits, tail) = rest.split_once(':')?;
    Some((digits.parse().ok()?, tail))
}

/// Simulated function generator end of a [`SimulatedBench`]
pub struct SimGenerator {
    bench: SimulatedBench,
}

impl SimGenerator {
    fn apply(&self, command: &str) -> InstrumentResult<()> {
        let Some((channel, rest)) = split_channel(command) else {
            return Ok(());
        };
        let mut state = self.bench.lock();
        if channel != state.awg_output {
            return Ok(());
        }

        if let Some(value) = rest.strip_prefix("BSWV FRQ,") {
            state.frequency_hz = parse_number(command, value)?;
            state.frequency_changes += 1;
        } else if let Some(value) = rest.strip_prefix("BSWV AMP,") {
            state.amplitude_vpp = parse_number(command, value)?;
        } else if rest == "OUTP ON" {
            state.output_on = true;
        } else if rest == "OUTP OFF" {
            state.output_on = false;
        }
        Ok(())
    }
}

#[async_trait]
impl InstrumentChannel for SimGenerator {
    async fn send(&self, command: &str) -> InstrumentResult<()> {
        self.bench.awg_log.push(format!("send {}", command));
        self.apply(command)
    }

    async fn ask(&self, query: &str) -> InstrumentResult<String> {
        self.bench.awg_log.push(format!("ask {}", query));
        match query {
            "*OPC?" => Ok("1".to_string()),
            "*IDN?" => Ok("Siglent Technologies,SDG-SIM,0000000000,1.0".to_string()),
            _ => Err(timeout(query)),
        }
    }

    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        self.ask(query).await.map(String::into_bytes)
    }

    fn describe(&self) -> String {
        "sim://awg".to_string()
    }
}

/// Simulated oscilloscope end of a [`SimulatedBench`]
pub struct SimScope {
    bench: SimulatedBench,
}

impl SimScope {
    fn answer(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        let state = self.bench.lock();
        match query {
            "*OPC?" => return Ok(b"1".to_vec()),
            "SARA?" => return Ok(SIM_SAMPLE_RATE.as_bytes().to_vec()),
            _ => {}
        }

        if let Some((channel, "PAVA? PKPK")) = split_channel(query) {
            if state.failing() {
                return Err(timeout(query));
            }
            let value = match state.vpp_at(channel) {
                Some(vpp) => format!("{:.4E}", vpp),
                None => "****".to_string(),
            };
            return Ok(format!("C{}:PAVA PKPK,{}V", channel, value).into_bytes());
        }

        if let Some(pair) = query.strip_suffix(":MEAD? PHA") {
            let channels = pair
                .split_once('-')
                .and_then(|(a, b)| Some((a.strip_prefix('C')?, b.strip_prefix('C')?)))
                .and_then(|(a, b)| Some((a.parse::<u8>().ok()?, b.parse::<u8>().ok()?)));
            let Some((output, reference)) = channels else {
                return Err(timeout(query));
            };

            let phase = if !state.output_on {
                None
            } else if (output, reference) == (state.out_channel, state.in_channel) {
                Some(state.reported_phase())
            } else if (output, reference) == (state.in_channel, state.out_channel) {
                let p = -state.reported_phase();
                Some(if p >= 270.0 { p - 360.0 } else { p })
            } else {
                None
            };
            let value = match phase {
                Some(p) => format!("{:.4E}", p),
                None => "****".to_string(),
            };
            let mut raw = format!("C{}-C{}:MEAD PHA,{}", output, reference, value).into_bytes();
            raw.extend_from_slice(&[0xA1, 0xE3]);
            return Ok(raw);
        }

        Err(timeout(query))
    }
}

#[async_trait]
impl InstrumentChannel for SimScope {
    async fn send(&self, command: &str) -> InstrumentResult<()> {
        self.bench.scope_log.push(format!("send {}", command));
        Ok(())
    }

    async fn ask(&self, query: &str) -> InstrumentResult<String> {
        self.bench.scope_log.push(format!("ask {}", query));
        let raw = self.answer(query)?;
        String::from_utf8(raw)
            .map(|text| text.trim().to_string())
            .map_err(|e| InstrumentError::decode(query, e.to_string()))
    }

    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        self.bench.scope_log.push(format!("ask_raw {}", query));
        self.answer(query)
    }

    fn describe(&self) -> String {
        "sim://dso".to_string()
    }
}
