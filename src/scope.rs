//! Measurement adapter for Siglent SDS1000X-U class oscilloscopes.
//!
//! This is the only place that knows how the oscilloscope misbehaves. Everything above it
//! sees two clean operations, [`Oscilloscope::read_vpp`] and [`Oscilloscope::read_phase_deg`].
//!
//! Firmware defects handled here:
//!
//! - The "all parameters" form of `PAVA?` returns truncated responses and leaves the command
//!   interpreter answering later queries with stale data. Every parameter is fetched with its
//!   own narrow query, and any response longer than [`MAX_RESPONSE_BYTES`] is rejected.
//! - `MEAD? PHA` responses end in two stray bytes (`0xA1 0xE3`) that are not valid text.
//!   The phase query goes through the raw byte path and the trailer is removed before decoding.
//! - The phase is reported in `[-90, 270)` degrees. It is returned as reported; the sample
//!   reducer maps it to `[-180, 180)`.
//! - A measurement the scope cannot make is reported as `****`. That is a fault, not zero.
//!
//! Responses are also checked against the channel that was asked for, so an answer that
//! belongs to an earlier query is caught instead of being recorded.

use crate::channel::InstrumentChannel;
use crate::error::{InstrumentError, InstrumentResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Responses must be shorter than this to be trusted
pub const MAX_RESPONSE_BYTES: usize = 40;

/// Vertical divisions used by the autoscale step (of 8 on screen)
pub const AUTOSCALE_DIVISIONS: f64 = 7.5;

/// Trailer appended to `MEAD?` responses
const MEAD_TRAILER: [u8; 2] = [0xA1, 0xE3];

/// Phase values outside this magnitude are treated as implausible
const MAX_PLAUSIBLE_PHASE_DEG: f64 = 360.0;

static PKPK_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^C(\d):PAVA PKPK,(.*)V$"));
static PHASE_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^C(\d)-C(\d):MEAD PHA,(.*)$"));
static SARA_RE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^SARA (.*)Sa/s$"));

/// Oscilloscope input channel (C1..C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeChannel(u8);

impl ScopeChannel {
    /// Number of analog inputs on the oscilloscope
    pub const COUNT: u8 = 4;

    /// Channel `index` (1-based); `None` when out of range.
    pub fn new(index: u8) -> Option<Self> {
        (1..=Self::COUNT).contains(&index).then_some(Self(index))
    }

    /// 1-based channel number
    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ScopeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Smallest 1-2-5 timebase setting longer than a quarter period of `frequency_hz`.
pub fn timebase_for(frequency_hz: f64) -> String {
    let quarter_period = 1.0 / (frequency_hz * 4.0);
    const UNITS: [(&str, f64); 4] = [("ns", 1e-9), ("us", 1e-6), ("ms", 1e-3), ("s", 1.0)];
    const STEPS: [u32; 9] = [1, 2, 5, 10, 20, 50, 100, 200, 500];

    for (unit, factor) in UNITS {
        for step in STEPS {
            if f64::from(step) * factor > quarter_period {
                return format!("{}{}", step, unit);
            }
        }
    }
    "1s".to_string()
}

/// Format a voltage with a `V`, `mV` or `uV` suffix.
pub fn volts_with_unit(volts: f64) -> String {
    const UNITS: [(&str, f64); 3] = [("V", 1.0), ("mV", 1e-3), ("uV", 1e-6)];
    for (unit, factor) in UNITS {
        if volts.abs() >= factor {
            let scaled = format!("{:.3}", volts / factor);
            let trimmed = scaled.trim_end_matches('0').trim_end_matches('.');
            return format!("{}{}", trimmed, unit);
        }
    }
    "1uV".to_string()
}

fn pattern(re: &'static Lazy<Result<Regex, regex::Error>>) -> InstrumentResult<&'static Regex> {
    Lazy::force(re)
        .as_ref()
        .map_err(|e| InstrumentError::decode("<pattern>", e.to_string()))
}

fn check_size(query: &str, len: usize) -> InstrumentResult<()> {
    if len >= MAX_RESPONSE_BYTES {
        return Err(InstrumentError::BufferOverflow {
            query: query.to_string(),
            len,
            limit: MAX_RESPONSE_BYTES,
        });
    }
    Ok(())
}

fn parse_channel(query: &str, digits: &str, expected: ScopeChannel) -> InstrumentResult<()> {
    if digits != expected.index().to_string() {
        return Err(InstrumentError::decode(
            query,
            format!("response is for C{}, expected {}", digits, expected),
        ));
    }
    Ok(())
}

fn parse_value(query: &str, value: &str) -> InstrumentResult<f64> {
    if value.starts_with('*') {
        return Err(InstrumentError::InvalidReading(format!(
            "'{}' reported no measurement",
            query
        )));
    }
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| InstrumentError::decode(query, format!("'{}': {}", value, e)))
}

/// Remove the line ending and the stray `MEAD?` trailer, then decode as text.
fn decode_raw(query: &str, raw: &[u8]) -> InstrumentResult<String> {
    let mut end = raw.len();
    while end > 0 && raw[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let body = match raw[..end].strip_suffix(&MEAD_TRAILER) {
        Some(body) => body,
        None => &raw[..end],
    };
    std::str::from_utf8(body)
        .map(|text| text.trim().to_string())
        .map_err(|e| InstrumentError::decode(query, e.to_string()))
}

/// Measurement side of the bench
pub struct Oscilloscope<C> {
    channel: C,
}

impl<C: InstrumentChannel> Oscilloscope<C> {
    /// Wrap an open channel to the oscilloscope.
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Peak-to-peak voltage on `input`, as displayed by the oscilloscope.
    ///
    /// # Errors
    /// - `BufferOverflow` if the response is longer than [`MAX_RESPONSE_BYTES`]
    /// - `DecodeFault` if the response does not match the query
    /// - `InvalidReading` if the scope reports no value or a non-positive one
    pub async fn read_vpp(&self, input: ScopeChannel) -> InstrumentResult<f64> {
        let query = format!("{}:PAVA? PKPK", input);
        let response = self.channel.ask(&query).await?;
        check_size(&query, response.len())?;

        let caps = pattern(&PKPK_RE)?
            .captures(&response)
            .ok_or_else(|| InstrumentError::decode(&query, format!("unexpected '{}'", response)))?;
        parse_channel(&query, &caps[1], input)?;

        let vpp = parse_value(&query, &caps[2])?;
        if !vpp.is_finite() || vpp <= 0.0 {
            return Err(InstrumentError::InvalidReading(format!(
                "{} Vpp {} is not positive",
                input, vpp
            )));
        }
        tracing::debug!(channel = %input, vpp, "Read Vpp");
        Ok(vpp)
    }

    /// Phase of `output` relative to `reference`, in the scope's `[-90, 270)` range.
    ///
    /// # Errors
    /// - `BufferOverflow` if the raw response is longer than [`MAX_RESPONSE_BYTES`]
    /// - `DecodeFault` if the payload is not text after removing the trailer, or names
    ///   other channels than requested
    /// - `InvalidReading` if the scope reports no value or an implausible one
    pub async fn read_phase_deg(
        &self,
        reference: ScopeChannel,
        output: ScopeChannel,
    ) -> InstrumentResult<f64> {
        let query = format!("{}-{}:MEAD? PHA", output, reference);
        let raw = self.channel.ask_raw(&query).await?;
        check_size(&query, raw.len())?;

        let response = decode_raw(&query, &raw)?;
        let caps = pattern(&PHASE_RE)?
            .captures(&response)
            .ok_or_else(|| InstrumentError::decode(&query, format!("unexpected '{}'", response)))?;
        parse_channel(&query, &caps[1], output)?;
        parse_channel(&query, &caps[2], reference)?;

        let phase = parse_value(&query, &caps[3])?;
        if !phase.is_finite() || phase.abs() > MAX_PLAUSIBLE_PHASE_DEG {
            return Err(InstrumentError::InvalidReading(format!(
                "phase {} deg is implausible",
                phase
            )));
        }
        tracing::debug!(%reference, %output, phase, "Read phase");
        Ok(phase)
    }

    /// Configure acquisition for a sweep.
    ///
    /// Probe attenuation on the scope is set to 1X; attenuation is applied to the
    /// readings by the sweep engine instead, so it is never applied twice. The
    /// screen therefore shows probe-side voltages, and the initial vertical scale is
    /// divided by each channel's attenuation to match.
    pub async fn prepare(
        &self,
        input: ScopeChannel,
        output: ScopeChannel,
        amplitude_vpp: f64,
        in_attenuation: f64,
        out_attenuation: f64,
        start_freq_hz: f64,
    ) -> InstrumentResult<()> {
        self.channel.send("CHDR SHORT").await?;
        self.set_timebase(start_freq_hz).await?;

        for (ch, attenuation) in [(input, in_attenuation), (output, out_attenuation)] {
            let vdiv = volts_with_unit(amplitude_vpp / (AUTOSCALE_DIVISIONS * attenuation));
            self.channel.send(&format!("{}:ATTN 1", ch)).await?;
            self.channel.send(&format!("{}:BWL OFF", ch)).await?;
            self.channel.send(&format!("{}:CPL D1M", ch)).await?;
            self.channel.send(&format!("{}:OFST 0V", ch)).await?;
            self.channel.send(&format!("{}:UNIT V", ch)).await?;
            self.channel.send(&format!("{}:VDIV {}", ch, vdiv)).await?;
        }

        self.channel.send(&format!("{}:TRCP DC", input)).await?;
        self.channel.send(&format!("{}:TRLV 0V", input)).await?;
        self.channel
            .send(&format!("TRSE EDGE,SR,{},HT,OFF", input))
            .await?;
        self.channel.send("TRMD AUTO").await?;
        self.wait_complete().await
    }

    /// Set the timebase to suit `frequency_hz`.
    pub async fn set_timebase(&self, frequency_hz: f64) -> InstrumentResult<()> {
        self.channel
            .send(&format!("TDIV {}", timebase_for(frequency_hz)))
            .await
    }

    /// Fit the vertical scale of `input` to its current peak-to-peak voltage.
    pub async fn autoscale(&self, input: ScopeChannel) -> InstrumentResult<()> {
        let vpp = self.read_vpp(input).await?;
        let vdiv = volts_with_unit(vpp / AUTOSCALE_DIVISIONS);
        self.channel
            .send(&format!("{}:VDIV {}", input, vdiv))
            .await
    }

    /// Current sample rate in samples per second.
    pub async fn sample_rate(&self) -> InstrumentResult<f64> {
        let query = "SARA?";
        let response = self.channel.ask(query).await?;
        check_size(query, response.len())?;
        let caps = pattern(&SARA_RE)?
            .captures(&response)
            .ok_or_else(|| InstrumentError::decode(query, format!("unexpected '{}'", response)))?;
        parse_value(query, &caps[1])
    }

    /// Block until the oscilloscope has processed all previous commands.
    pub async fn wait_complete(&self) -> InstrumentResult<()> {
        let response = self.channel.ask("*OPC?").await?;
        if response.trim() != "1" {
            return Err(InstrumentError::decode(
                "*OPC?",
                format!("unexpected '{}'", response),
            ));
        }
        Ok(())
    }
}
