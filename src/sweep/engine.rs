//! Sweep scheduler.
//!
//! The engine owns both instrument channels for the duration of a sweep and walks the
//! frequency plan strictly in order:
//!
//! ```text
//! for each frequency:
//!     scope.set_timebase(f)
//!     generator.set_frequency(f)       (acknowledged with *OPC?)
//!     sleep(settle delay)
//!     autoscale both channels          (optional)
//!     sleep(settle delay + 100 ms)     (only after autoscale)
//!     read Vpp(in), Vpp(out), phase    (repeated and averaged at higher quality)
//!     reduce -> MeasurementSample
//! ```
//!
//! The only suspension points are instrument exchanges and the settle wait. Nothing is
//! spawned, so at most one command is ever outstanding on either instrument.
//!
//! Measurement faults are never retried. Depending on [`FaultPolicy`] the sweep either
//! aborts with the samples collected so far or records the frequency as skipped and
//! moves on.

use super::plan::{quality_profile, Quality, SweepPlan};
use super::reducer::{reduce_many, RawReading};
use super::{CancelToken, SweepResult, SweepState, Timer, TokioTimer};
use crate::channel::InstrumentChannel;
use crate::error::{EngineFault, EngineFaultKind, InstrumentResult, MeasurementFault};
use crate::generator::{AwgChannel, FunctionGenerator};
use crate::scope::{Oscilloscope, ScopeChannel};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Below this frequency an extra settle second is added; the scope needs several
/// periods on screen before its measurements stabilise.
pub const LOW_FREQUENCY_HZ: f64 = 100.0;

/// Extra settle time for points below [`LOW_FREQUENCY_HZ`]
pub const LOW_FREQUENCY_SETTLE: Duration = Duration::from_secs(1);

/// Pause between repeated acquisitions of the same point
pub const REPEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Added to the settle delay after the vertical scale changes
pub const RESCALE_SETTLE: Duration = Duration::from_millis(100);

/// Longest accepted settle delay, in seconds
pub const MAX_DELAY_SECS: f64 = 3600.0;

/// What to do when a point cannot be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Stop the sweep and return the samples collected so far
    #[default]
    Abort,
    /// Record the frequency as skipped and continue with the next one
    Skip,
}

/// Parameters of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Oscilloscope channel probing the DUT input (1-4)
    pub in_channel: u8,
    /// Oscilloscope channel probing the DUT output (1-4)
    pub out_channel: u8,
    /// Generator output driving the DUT (1-2)
    pub awg_channel: u8,
    /// Sine amplitude in volts peak-to-peak
    pub amplitude_vpp: f64,
    /// First frequency of the sweep
    pub start_freq_hz: f64,
    /// Last frequency of the sweep
    pub end_freq_hz: f64,
    /// Probe attenuation factor on the input channel
    pub in_attenuation: f64,
    /// Probe attenuation factor on the output channel
    pub out_attenuation: f64,
    /// Resolution/averaging level
    pub quality: Quality,
    /// Settle delay after each frequency change, in seconds
    pub delay_secs: f64,
    /// Fault handling
    pub on_fault: FaultPolicy,
    /// Fit the vertical scale of both channels before measuring each point
    pub autoscale: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            in_channel: 1,
            out_channel: 2,
            awg_channel: 1,
            amplitude_vpp: 1.0,
            start_freq_hz: 1000.0,
            end_freq_hz: 100_000.0,
            in_attenuation: 10.0,
            out_attenuation: 10.0,
            quality: Quality::MIN,
            delay_secs: 0.0,
            on_fault: FaultPolicy::Abort,
            autoscale: true,
        }
    }
}

impl SweepConfig {
    /// Check ranges and build the frequency plan.
    pub fn validate(&self) -> Result<SweepPlan, String> {
        let input = ScopeChannel::new(self.in_channel)
            .ok_or_else(|| format!("in_channel must be 1-4, got {}", self.in_channel))?;
        let output = ScopeChannel::new(self.out_channel)
            .ok_or_else(|| format!("out_channel must be 1-4, got {}", self.out_channel))?;
        if input == output {
            return Err(format!("in_channel and out_channel are both {}", input));
        }
        AwgChannel::new(self.awg_channel)
            .ok_or_else(|| format!("awg_channel must be 1-2, got {}", self.awg_channel))?;

        let positive = [
            ("amplitude_vpp", self.amplitude_vpp),
            ("in_attenuation", self.in_attenuation),
            ("out_attenuation", self.out_attenuation),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{} must be positive, got {}", name, value));
            }
        }
        if !(0.0..=MAX_DELAY_SECS).contains(&self.delay_secs) {
            return Err(format!(
                "delay_secs must be between 0 and {}, got {}",
                MAX_DELAY_SECS, self.delay_secs
            ));
        }

        SweepPlan::new(self.start_freq_hz, self.end_freq_hz, self.quality).map_err(|e| e.to_string())
    }

    /// Settle delay as a `Duration`; zero when `delay_secs` is out of range.
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_secs).unwrap_or_default()
    }

    /// Settle time after switching to `frequency_hz`.
    pub fn settle_for(&self, frequency_hz: f64) -> Duration {
        let delay = self.delay();
        if frequency_hz < LOW_FREQUENCY_HZ {
            delay + LOW_FREQUENCY_SETTLE
        } else {
            delay
        }
    }

    /// Wait after autoscale before the first reading.
    pub fn rescale_wait(&self) -> Duration {
        self.delay() + RESCALE_SETTLE
    }
}

/// Sweep scheduler owning both instruments
///
/// # Example
///
/// ```no_run
/// use bode_sweep::channel::TcpChannel;
/// use bode_sweep::sweep::{SweepConfig, SweepEngine};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let awg = TcpChannel::connect("192.168.1.20").await?;
/// let dso = TcpChannel::connect("192.168.1.21").await?;
///
/// let mut engine = SweepEngine::new(awg, dso, SweepConfig::default())?;
/// let result = engine.run().await?;
/// for sample in &result {
///     println!("{} Hz: {:.2} dB, {:.1} deg", sample.frequency_hz, sample.gain_db, sample.phase_deg);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SweepEngine<G, S, T = TokioTimer> {
    generator: FunctionGenerator<G>,
    scope: Oscilloscope<S>,
    timer: T,
    cancel: CancelToken,
    config: SweepConfig,
    plan: SweepPlan,
    input: ScopeChannel,
    output: ScopeChannel,
    state: SweepState,
}

impl<G, S> SweepEngine<G, S, TokioTimer>
where
    G: InstrumentChannel,
    S: InstrumentChannel,
{
    /// Validate `config`, plan the sweep and take ownership of both channels.
    pub fn new(generator: G, scope: S, config: SweepConfig) -> Result<Self, EngineFault> {
        let invalid = |msg: String| EngineFault::new(EngineFaultKind::InvalidConfig(msg), SweepResult::default());

        let plan = config.validate().map_err(invalid)?;
        let (input, output, awg) = match (
            ScopeChannel::new(config.in_channel),
            ScopeChannel::new(config.out_channel),
            AwgChannel::new(config.awg_channel),
        ) {
            (Some(i), Some(o), Some(a)) => (i, o, a),
            _ => return Err(invalid("channel out of range".to_string())),
        };

        Ok(Self {
            generator: FunctionGenerator::new(generator, awg),
            scope: Oscilloscope::new(scope),
            timer: TokioTimer,
            cancel: CancelToken::never(),
            config,
            plan,
            input,
            output,
            state: SweepState::Idle,
        })
    }
}

impl<G, S, T> SweepEngine<G, S, T>
where
    G: InstrumentChannel,
    S: InstrumentChannel,
    T: Timer,
{
    /// Use `timer` for settle delays.
    pub fn with_timer<U: Timer>(self, timer: U) -> SweepEngine<G, S, U> {
        SweepEngine {
            generator: self.generator,
            scope: self.scope,
            timer,
            cancel: self.cancel,
            config: self.config,
            plan: self.plan,
            input: self.input,
            output: self.output,
            state: self.state,
        }
    }

    /// Stop at the next step boundary once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Current scheduler state
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// The frequency plan
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// The sweep parameters
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Generator controller
    pub fn generator(&self) -> &FunctionGenerator<G> {
        &self.generator
    }

    /// Oscilloscope adapter
    pub fn scope(&self) -> &Oscilloscope<S> {
        &self.scope
    }

    fn enter(&mut self, state: SweepState) {
        tracing::trace!(from = %self.state, to = %state, "Sweep state");
        self.state = state;
    }

    /// Run the whole plan.
    ///
    /// The generator output is switched off before returning, whatever the outcome.
    #[tracing::instrument(skip_all, fields(points = self.plan.len(), quality = %self.config.quality))]
    pub async fn run(&mut self) -> Result<SweepResult, EngineFault> {
        self.enter(SweepState::Idle);
        let outcome = self.run_plan().await;

        if let Err(e) = self.generator.set_output(false).await {
            tracing::warn!(error = %e, "Failed to switch generator output off");
        }

        match &outcome {
            Ok(result) => {
                self.enter(SweepState::Done);
                tracing::info!(samples = result.len(), skipped = result.skipped.len(), "Sweep complete");
            }
            Err(fault) => {
                self.enter(SweepState::Aborted);
                tracing::error!(
                    error = %fault,
                    collected = fault.partial.len(),
                    "Sweep aborted"
                );
            }
        }
        outcome
    }

    async fn run_plan(&mut self) -> Result<SweepResult, EngineFault> {
        let mut result = SweepResult::default();

        self.enter(SweepState::Planning);
        if let Err(e) = self.prepare().await {
            return Err(EngineFault::new(EngineFaultKind::Setup(e), result));
        }

        let repeats = quality_profile(self.config.quality).repeats;
        let frequencies: Vec<f64> = self.plan.iter().collect();

        for (index, frequency_hz) in frequencies.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(completed = index, "Sweep cancelled");
                return Err(EngineFault::new(
                    EngineFaultKind::Cancelled { completed: index },
                    result,
                ));
            }

            self.enter(SweepState::Stepping);
            if let Err(source) = self.scope.set_timebase(frequency_hz).await {
                self.on_fault(MeasurementFault { frequency_hz, source }, &mut result)?;
                continue;
            }
            if let Err(source) = self.step_to(frequency_hz).await {
                return Err(EngineFault::new(
                    EngineFaultKind::Generator {
                        frequency_hz,
                        source,
                    },
                    result,
                ));
            }

            self.enter(SweepState::Settling);
            self.timer.sleep(self.config.settle_for(frequency_hz)).await;
            if self.cancel.is_cancelled() {
                tracing::warn!(completed = index, frequency_hz, "Sweep cancelled while settling");
                return Err(EngineFault::new(
                    EngineFaultKind::Cancelled { completed: index },
                    result,
                ));
            }

            self.enter(SweepState::Measuring);
            match self.measure(repeats).await {
                Ok(readings) => match reduce_many(frequency_hz, &readings) {
                    Ok(sample) => {
                        tracing::info!(
                            frequency_hz,
                            gain_db = sample.gain_db,
                            phase_deg = sample.phase_deg,
                            "Sample"
                        );
                        result.samples.push(sample);
                    }
                    Err(source) => {
                        self.on_fault(MeasurementFault { frequency_hz, source }, &mut result)?
                    }
                },
                Err(source) => {
                    self.on_fault(MeasurementFault { frequency_hz, source }, &mut result)?
                }
            }

            self.enter(SweepState::Advancing);
        }

        Ok(result)
    }

    /// Apply the fault policy. Returns `Err` with the partial result when aborting.
    fn on_fault(&self, fault: MeasurementFault, result: &mut SweepResult) -> Result<(), EngineFault> {
        match self.config.on_fault {
            FaultPolicy::Abort => Err(EngineFault::new(fault, std::mem::take(result))),
            FaultPolicy::Skip => {
                tracing::warn!(error = %fault, "Skipping point");
                result.skipped.push(fault.frequency_hz);
                Ok(())
            }
        }
    }

    async fn prepare(&mut self) -> InstrumentResult<()> {
        self.scope
            .prepare(
                self.input,
                self.output,
                self.config.amplitude_vpp,
                self.config.in_attenuation,
                self.config.out_attenuation,
                self.config.start_freq_hz,
            )
            .await?;
        self.generator.configure_sine(self.config.amplitude_vpp).await?;
        self.generator.wait_complete().await?;

        match self.scope.sample_rate().await {
            Ok(rate) => tracing::info!(sample_rate = rate, "Oscilloscope sample rate (Sa/s)"),
            Err(e) => tracing::warn!(error = %e, "Could not read sample rate"),
        }
        Ok(())
    }

    async fn step_to(&mut self, frequency_hz: f64) -> InstrumentResult<()> {
        self.generator.set_frequency(frequency_hz).await
    }

    async fn measure(&self, repeats: usize) -> InstrumentResult<Vec<RawReading>> {
        if self.config.autoscale {
            self.scope.autoscale(self.input).await?;
            self.scope.autoscale(self.output).await?;
            self.scope.wait_complete().await?;
            self.timer.sleep(self.config.rescale_wait()).await;
        }

        let mut readings = Vec::with_capacity(repeats);
        for repeat in 0..repeats {
            if repeat > 0 {
                self.timer.sleep(REPEAT_INTERVAL).await;
            }
            let vpp_in = self.scope.read_vpp(self.input).await?;
            let vpp_out = self.scope.read_vpp(self.output).await?;
            let raw_phase_deg = self.scope.read_phase_deg(self.input, self.output).await?;

            readings.push(
                RawReading {
                    vpp_in,
                    vpp_out,
                    raw_phase_deg,
                }
                .attenuated(self.config.in_attenuation, self.config.out_attenuation),
            );
        }
        Ok(readings)
    }
}

/// Run one sweep with the default timer.
///
/// Convenience wrapper around [`SweepEngine`]; both channels are dropped when it returns.
pub async fn run_sweep<G, S>(
    generator: G,
    scope: S,
    config: SweepConfig,
    cancel: CancelToken,
) -> Result<SweepResult, EngineFault>
where
    G: InstrumentChannel,
    S: InstrumentChannel,
{
    SweepEngine::new(generator, scope, config)?
        .with_cancel(cancel)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CallLog, MockChannel, MockReply};
    use crate::error::InstrumentError;
    use crate::sweep::CancelHandle;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTimer(Arc<Mutex<Vec<Duration>>>);

    #[async_trait::async_trait]
    impl Timer for RecordingTimer {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn generator() -> MockChannel {
        MockChannel::new().named("awg").on("*OPC?", MockReply::text("1"))
    }

    fn scope(vpp_in: &str, vpp_out: &str, phase: &[u8]) -> MockChannel {
        MockChannel::new()
            .named("dso")
            .on("*OPC?", MockReply::text("1"))
            .on("SARA?", MockReply::text("SARA 1.00E+09Sa/s"))
            .on("C1:PAVA? PKPK", MockReply::text(format!("C1:PAVA PKPK,{}V", vpp_in)))
            .on("C2:PAVA? PKPK", MockReply::text(format!("C2:PAVA PKPK,{}V", vpp_out)))
            .on("C2-C1:MEAD? PHA", MockReply::Raw(phase.to_vec()))
    }

    fn config() -> SweepConfig {
        SweepConfig {
            start_freq_hz: 1000.0,
            end_freq_hz: 10_000.0,
            autoscale: false,
            ..SweepConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let plan = SweepConfig::default().validate().unwrap();
        assert_eq!(plan.frequencies()[0], 1000.0);
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            SweepConfig { in_channel: 5, ..SweepConfig::default() },
            SweepConfig { out_channel: 1, ..SweepConfig::default() },
            SweepConfig { awg_channel: 3, ..SweepConfig::default() },
            SweepConfig { amplitude_vpp: 0.0, ..SweepConfig::default() },
            SweepConfig { out_attenuation: -1.0, ..SweepConfig::default() },
            SweepConfig { delay_secs: -0.5, ..SweepConfig::default() },
            SweepConfig { delay_secs: 1e20, ..SweepConfig::default() },
            SweepConfig { delay_secs: f64::NAN, ..SweepConfig::default() },
            SweepConfig { start_freq_hz: 5000.0, end_freq_hz: 100.0, ..SweepConfig::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_settle_for_low_frequency() {
        let config = SweepConfig { delay_secs: 0.5, ..SweepConfig::default() };
        assert_eq!(config.settle_for(1000.0), Duration::from_millis(500));
        assert_eq!(config.settle_for(50.0), Duration::from_millis(1500));
    }

    #[test]
    fn test_huge_delay_is_rejected_without_panicking() {
        let config = SweepConfig { delay_secs: 1e20, ..SweepConfig::default() };
        assert!(config.validate().is_err());
        assert_eq!(config.settle_for(1000.0), Duration::ZERO);
        assert_eq!(config.settle_for(50.0), LOW_FREQUENCY_SETTLE);

        let err = SweepEngine::new(generator(), scope("1", "1", b""), config).err().unwrap();
        assert!(matches!(err.kind, EngineFaultKind::InvalidConfig(_)));

        let longest = SweepConfig { delay_secs: MAX_DELAY_SECS, ..SweepConfig::default() };
        assert!(longest.validate().is_ok());
        assert_eq!(longest.settle_for(1000.0), Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_config_rejected_by_engine() {
        let config = SweepConfig { quality: Quality::MIN, start_freq_hz: 0.0, ..config() };
        let err = SweepEngine::new(generator(), scope("1", "1", b""), config).err().unwrap();
        assert!(matches!(err.kind, EngineFaultKind::InvalidConfig(_)));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_applies_attenuation_and_normalizes_phase() {
        let awg = generator();
        let awg_log = awg.log();
        let mut engine = SweepEngine::new(
            awg,
            scope("2.00E+00", "1.00E+00", b"C2-C1:MEAD PHA,2.700000E+02\xa1\xe3"),
            SweepConfig { out_attenuation: 1.0, ..config() },
        )
        .unwrap()
        .with_timer(RecordingTimer::default());

        let result = engine.run().await.unwrap();

        assert_eq!(engine.state(), SweepState::Done);
        assert_eq!(result.len(), engine.plan().len());
        for sample in &result {
            // 2 V x10 in, 1 V x1 out
            assert!((sample.vpp_in - 20.0).abs() < 1e-9);
            assert!((sample.gain_db - -26.0206).abs() < 1e-4);
            assert_eq!(sample.phase_deg, -90.0);
        }
        assert!(result.frequencies().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(awg_log.count_prefix("send C1:BSWV FRQ,"), engine.plan().len());
        assert_eq!(
            awg_log.entries().last().map(String::as_str),
            Some("send C1:OUTP OFF")
        );
    }

    #[tokio::test]
    async fn test_frequency_is_acknowledged_before_measuring() {
        let awg = generator();
        let awg_log = awg.log();
        let dso = scope("1", "1", b"C2-C1:MEAD PHA,0");
        let dso_log = dso.log();
        let mut engine = SweepEngine::new(awg, dso, config())
            .unwrap()
            .with_timer(RecordingTimer::default());
        engine.run().await.unwrap();

        let awg_entries = awg_log.entries();
        let first_frq = awg_entries
            .iter()
            .position(|e| e.starts_with("send C1:BSWV FRQ,"))
            .unwrap();
        assert_eq!(awg_entries[first_frq + 1], "ask *OPC?");
        assert!(dso_log.entries().iter().all(|e| !e.contains("ALL")));
    }

    #[tokio::test]
    async fn test_settle_delay_used_for_each_point() {
        let timer = RecordingTimer::default();
        let mut engine = SweepEngine::new(
            generator(),
            scope("1", "1", b"C2-C1:MEAD PHA,0"),
            SweepConfig { delay_secs: 0.25, ..config() },
        )
        .unwrap()
        .with_timer(timer.clone());
        engine.run().await.unwrap();

        let sleeps = timer.0.lock().unwrap().clone();
        assert_eq!(sleeps.len(), engine.plan().len());
        assert!(sleeps.iter().all(|d| *d == Duration::from_millis(250)));
    }

    /// Writes each sleep into the oscilloscope's call log.
    struct LoggingTimer(CallLog);

    #[async_trait::async_trait]
    impl Timer for LoggingTimer {
        async fn sleep(&self, duration: Duration) {
            self.0.push(format!("sleep {:?}", duration));
        }
    }

    #[tokio::test]
    async fn test_scale_changes_settle_before_readings() {
        let dso = scope("1.00E+00", "5.00E-01", b"C2-C1:MEAD PHA,0");
        let dso_log = dso.log();
        let mut engine = SweepEngine::new(
            generator(),
            dso,
            SweepConfig { autoscale: true, delay_secs: 0.5, ..config() },
        )
        .unwrap()
        .with_timer(LoggingTimer(dso_log.clone()));
        engine.run().await.unwrap();

        let entries = dso_log.entries();
        // Channels whose vertical scale changed since the last sleep; "TDIV" affects all
        let mut unsettled: Vec<String> = Vec::new();
        let mut readings = 0;
        for entry in &entries {
            if entry.starts_with("sleep ") {
                unsettled.clear();
            } else if entry.starts_with("send TDIV ") {
                unsettled.push("TDIV".to_string());
            } else if let Some(rest) = entry.strip_prefix("send ") {
                if let Some((ch, _)) = rest.split_once(":VDIV ") {
                    unsettled.push(ch.to_string());
                }
            } else if let Some(rest) = entry.strip_prefix("ask C") {
                let ch = format!("C{}", &rest[..1]);
                assert!(
                    !unsettled.iter().any(|c| c == "TDIV" || *c == ch),
                    "{} read right after a scale change: {:?}",
                    ch,
                    entries
                );
                readings += 1;
            } else if entry.starts_with("ask_raw ") {
                assert!(unsettled.is_empty(), "phase read right after a scale change: {:?}", entries);
            }
        }
        assert!(readings > 0);

        // Per point: timebase, settle, autoscale, settle again, then the readings
        let first_point = entries
            .iter()
            .skip_while(|e| !e.starts_with("ask SARA?"))
            .skip(1)
            .take(9)
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(
            first_point,
            vec![
                "send TDIV 500us",
                "sleep 500ms",
                "ask C1:PAVA? PKPK",
                "send C1:VDIV 133.333mV",
                "ask C2:PAVA? PKPK",
                "send C2:VDIV 66.667mV",
                "ask *OPC?",
                "sleep 600ms",
                "ask C1:PAVA? PKPK",
            ]
        );
    }

    #[tokio::test]
    async fn test_quality_repeats_are_averaged() {
        let dso = scope("1", "1", b"C2-C1:MEAD PHA,10");
        let dso_log = dso.log();
        let config = SweepConfig {
            quality: Quality::new(8).unwrap(),
            end_freq_hz: 1100.0,
            ..config()
        };
        let repeats = quality_profile(config.quality).repeats;
        let mut engine = SweepEngine::new(generator(), dso, config)
            .unwrap()
            .with_timer(RecordingTimer::default());

        let result = engine.run().await.unwrap();
        assert_eq!(
            dso_log.count_prefix("ask_raw C2-C1:MEAD? PHA"),
            result.len() * repeats
        );
        assert!(result.iter().all(|s| (s.phase_deg - 10.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_measurement_fault_aborts_with_partial_result() {
        let dso = scope("1", "5.00E-01", b"C2-C1:MEAD PHA,0");
        // Third point: input channel stops answering.
        dso.push_reply("C1:PAVA? PKPK", MockReply::text("C1:PAVA PKPK,1V"));
        dso.push_reply("C1:PAVA? PKPK", MockReply::text("C1:PAVA PKPK,1V"));
        dso.push_reply("C1:PAVA? PKPK", MockReply::Timeout);

        let mut engine = SweepEngine::new(generator(), dso, config())
            .unwrap()
            .with_timer(RecordingTimer::default());
        let third = engine.plan().frequencies()[2];

        let fault = engine.run().await.unwrap_err();

        assert_eq!(engine.state(), SweepState::Aborted);
        assert_eq!(fault.partial.len(), 2);
        assert_eq!(fault.frequency_hz(), Some(third));
        match fault.kind {
            EngineFaultKind::Measurement(MeasurementFault { source, .. }) => {
                assert!(matches!(source, InstrumentError::ProtocolTimeout { .. }))
            }
            other => panic!("unexpected fault: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let dso = scope("1", "1", b"C2-C1:MEAD PHA,0");
        dso.push_reply("C1:PAVA? PKPK", MockReply::text("C1:PAVA PKPK,****V"));

        let mut engine = SweepEngine::new(
            generator(),
            dso,
            SweepConfig { on_fault: FaultPolicy::Skip, ..config() },
        )
        .unwrap()
        .with_timer(RecordingTimer::default());
        let first = engine.plan().frequencies()[0];

        let result = engine.run().await.unwrap();
        assert_eq!(result.skipped, vec![first]);
        assert_eq!(result.len(), engine.plan().len() - 1);
    }

    #[tokio::test]
    async fn test_generator_fault() {
        let awg = MockChannel::new()
            .on("*OPC?", MockReply::text("1"))
            .expect("*OPC?", MockReply::text("1"))
            .expect("*OPC?", MockReply::text("1"))
            .expect("*OPC?", MockReply::Timeout);

        let mut engine = SweepEngine::new(awg, scope("1", "1", b"C2-C1:MEAD PHA,0"), config())
            .unwrap()
            .with_timer(RecordingTimer::default());
        let second = engine.plan().frequencies()[1];

        let fault = engine.run().await.unwrap_err();
        assert!(matches!(fault.kind, EngineFaultKind::Generator { .. }));
        assert_eq!(fault.frequency_hz(), Some(second));
        assert_eq!(fault.partial.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_fault() {
        let dso = MockChannel::new();
        let mut engine = SweepEngine::new(generator(), dso, config())
            .unwrap()
            .with_timer(RecordingTimer::default());

        let fault = engine.run().await.unwrap_err();
        assert!(matches!(fault.kind, EngineFaultKind::Setup(_)));
        assert!(fault.partial.is_empty());
    }

    /// Cancels the sweep during the first settle wait.
    struct CancellingTimer(CancelHandle);

    #[async_trait::async_trait]
    impl Timer for CancellingTimer {
        async fn sleep(&self, _duration: Duration) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancel_while_settling_skips_measurement() {
        let (handle, token) = CancelToken::pair();
        let dso = scope("1", "1", b"C2-C1:MEAD PHA,0");
        let dso_log = dso.log();
        let mut engine = SweepEngine::new(generator(), dso, config())
            .unwrap()
            .with_timer(CancellingTimer(handle))
            .with_cancel(token);

        let fault = engine.run().await.unwrap_err();
        assert!(matches!(fault.kind, EngineFaultKind::Cancelled { completed: 0 }));
        assert_eq!(dso_log.count_prefix("ask C1:PAVA?"), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_first_step() {
        let (handle, token) = CancelToken::pair();
        handle.cancel();

        let awg = generator();
        let awg_log = awg.log();
        let mut engine = SweepEngine::new(awg, scope("1", "1", b"C2-C1:MEAD PHA,0"), config())
            .unwrap()
            .with_timer(RecordingTimer::default())
            .with_cancel(token);

        let fault = engine.run().await.unwrap_err();
        assert!(fault.is_cancelled());
        assert!(fault.partial.is_empty());
        assert_eq!(awg_log.count_prefix("send C1:BSWV FRQ,"), 0);
        assert_eq!(
            awg_log.entries().last().map(String::as_str),
            Some("send C1:OUTP OFF")
        );
    }
}
