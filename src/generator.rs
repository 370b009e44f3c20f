//! Generator controller for Siglent SDG class function generators.
//!
//! Only the basic sine wave settings are touched. Channel coupling and tracking on the
//! generator are front-panel settings and are left as the operator configured them.

use crate::channel::InstrumentChannel;
use crate::error::{InstrumentError, InstrumentResult};
use std::fmt;

/// Function generator output channel (C1 or C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwgChannel(u8);

impl AwgChannel {
    /// Number of outputs on the generator
    pub const COUNT: u8 = 2;

    /// Output `index` (1-based); `None` when out of range.
    pub fn new(index: u8) -> Option<Self> {
        (1..=Self::COUNT).contains(&index).then_some(Self(index))
    }

    /// 1-based output number
    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for AwgChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Generator settings as last acknowledged by the instrument
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Output driving the device under test
    pub output_channel: AwgChannel,
    /// Sine amplitude in volts peak-to-peak
    pub amplitude_vpp: f64,
    /// Last frequency set, `None` before the first step
    pub current_frequency_hz: Option<f64>,
}

/// Stimulus side of the bench
pub struct FunctionGenerator<C> {
    channel: C,
    config: GeneratorConfig,
}

impl<C: InstrumentChannel> FunctionGenerator<C> {
    /// Wrap an open channel to the generator, driving `output`.
    pub fn new(channel: C, output: AwgChannel) -> Self {
        Self {
            channel,
            config: GeneratorConfig {
                output_channel: output,
                amplitude_vpp: 0.0,
                current_frequency_hz: None,
            },
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Mirror of the generator state.
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Select a high-impedance sine output with no offset at `amplitude_vpp` and
    /// switch it on.
    pub async fn configure_sine(&mut self, amplitude_vpp: f64) -> InstrumentResult<()> {
        let ch = self.config.output_channel;
        self.channel
            .send(&format!("{}:OUTP LOAD,HZ,PLRT,NOR", ch))
            .await?;
        self.channel
            .send(&format!("{}:BSWV WVTP,SINE", ch))
            .await?;
        self.channel.send(&format!("{}:BSWV OFST,0", ch)).await?;
        self.set_amplitude(amplitude_vpp).await?;
        self.set_output(true).await
    }

    /// Set the sine amplitude. Called once before the sweep.
    pub async fn set_amplitude(&mut self, amplitude_vpp: f64) -> InstrumentResult<()> {
        let ch = self.config.output_channel;
        self.channel
            .send(&format!("{}:BSWV AMP,{}", ch, amplitude_vpp))
            .await?;
        self.config.amplitude_vpp = amplitude_vpp;
        Ok(())
    }

    /// Set the output frequency and wait for the generator to acknowledge it.
    pub async fn set_frequency(&mut self, frequency_hz: f64) -> InstrumentResult<()> {
        let ch = self.config.output_channel;
        self.channel
            .send(&format!("{}:BSWV FRQ,{}", ch, frequency_hz))
            .await?;
        self.wait_complete().await?;
        self.config.current_frequency_hz = Some(frequency_hz);
        tracing::debug!(channel = %ch, frequency_hz, "Generator frequency set");
        Ok(())
    }

    /// Switch the output on or off.
    pub async fn set_output(&mut self, on: bool) -> InstrumentResult<()> {
        let state = if on { "ON" } else { "OFF" };
        self.channel
            .send(&format!("{}:OUTP {}", self.config.output_channel, state))
            .await
    }

    /// Block until the generator has processed all previous commands.
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
