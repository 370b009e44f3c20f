//! CLI entry point for bode_sweep
//!
//! Runs one frequency-response sweep and prints the result table.
//!
//! # Usage
//!
//! Against real instruments:
//! ```bash
//! bode_sweep --generator 192.168.1.20 --scope 192.168.1.21 --fs 100 --fe 1e6 -q 3
//! ```
//!
//! Against the simulated RC filter (cutoff 15.9 kHz), saving a CSV:
//! ```bash
//! bode_sweep --simulate 15900 --csv sweep.csv
//! ```
//!
//! Command line options override `bode.toml` and `BODE_*` environment variables.

use anyhow::{anyhow, bail, Context, Result};
use bode_sweep::channel::{InstrumentChannel, SimulatedBench, TcpChannel};
use bode_sweep::config::{BenchConfig, EndpointConfig, DEFAULT_CONFIG_FILE};
use bode_sweep::logging;
use bode_sweep::storage;
use bode_sweep::sweep::{CancelToken, FaultPolicy, Quality, SweepEngine, SweepResult};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bode_sweep")]
#[command(about = "Measure a Bode plot with a Siglent function generator and oscilloscope", long_about = None)]
struct Cli {
    /// Oscilloscope channel probing the DUT input
    #[arg(long = "in", value_name = "CH")]
    in_channel: Option<u8>,

    /// Oscilloscope channel probing the DUT output
    #[arg(long = "out", value_name = "CH")]
    out_channel: Option<u8>,

    /// Generator output driving the DUT
    #[arg(long = "awg", value_name = "CH")]
    awg_channel: Option<u8>,

    /// Sine amplitude (Vpp)
    #[arg(long = "amp", value_name = "VPP")]
    amplitude: Option<f64>,

    /// Start frequency (Hz)
    #[arg(long = "fs", value_name = "HZ")]
    start: Option<f64>,

    /// End frequency (Hz)
    #[arg(long = "fe", value_name = "HZ")]
    end: Option<f64>,

    /// Input probe attenuation
    #[arg(long = "a1", value_name = "FACTOR")]
    in_attenuation: Option<f64>,

    /// Output probe attenuation
    #[arg(long = "a2", value_name = "FACTOR")]
    out_attenuation: Option<f64>,

    /// Quality, 1 (fast) to 10 (fine)
    #[arg(short = 'q', long = "quality", value_parser = clap::value_parser!(u8).range(1..=10))]
    quality: Option<u8>,

    /// Settle delay after each frequency change (s)
    #[arg(short = 'd', long = "delay", value_name = "SECS")]
    delay: Option<f64>,

    /// What to do when a point cannot be measured
    #[arg(long = "on-fault", value_enum)]
    on_fault: Option<FaultPolicy>,

    /// Skip the per-point vertical autoscale
    #[arg(long)]
    no_autoscale: bool,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Oscilloscope address (host or host:port)
    #[arg(long)]
    scope: Option<String>,

    /// Function generator address (host or host:port)
    #[arg(long)]
    generator: Option<String>,

    /// Use a simulated RC low-pass with this cutoff (Hz) instead of instruments
    #[arg(long, value_name = "CUTOFF_HZ", conflicts_with_all = ["scope", "generator"])]
    simulate: Option<f64>,

    /// Write the result to this CSV file
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Apply command line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut BenchConfig) -> Result<()> {
        let sweep = &mut config.sweep;
        if let Some(v) = self.in_channel {
            sweep.in_channel = v;
        }
        if let Some(v) = self.out_channel {
            sweep.out_channel = v;
        }
        if let Some(v) = self.awg_channel {
            sweep.awg_channel = v;
        }
        if let Some(v) = self.amplitude {
            sweep.amplitude_vpp = v;
        }
        if let Some(v) = self.start {
            sweep.start_freq_hz = v;
        }
        if let Some(v) = self.end {
            sweep.end_freq_hz = v;
        }
        if let Some(v) = self.in_attenuation {
            sweep.in_attenuation = v;
        }
        if let Some(v) = self.out_attenuation {
            sweep.out_attenuation = v;
        }
        if let Some(v) = self.quality {
            sweep.quality = Quality::try_from(v).map_err(|e| anyhow!(e))?;
        }
        if let Some(v) = self.delay {
            sweep.delay_secs = v;
        }
        if let Some(v) = self.on_fault {
            sweep.on_fault = v;
        }
        if self.no_autoscale {
            sweep.autoscale = false;
        }
        if let Some(address) = &self.scope {
            config.scope.address = Some(address.clone());
        }
        if let Some(address) = &self.generator {
            config.generator.address = Some(address.clone());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    cli.apply(&mut config)?;
    config.validate().map_err(|e| anyhow!(e)).context("Invalid configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let (generator, scope) = match cli.simulate {
        Some(cutoff_hz) => {
            tracing::info!(cutoff_hz, "Using simulated bench");
            let sweep = &config.sweep;
            let bench = SimulatedBench::new(cutoff_hz)
                .with_wiring(sweep.awg_channel, sweep.in_channel, sweep.out_channel)
                .with_probe_ratio(sweep.in_attenuation);
            let generator: Box<dyn InstrumentChannel> = Box::new(bench.generator());
            let scope: Box<dyn InstrumentChannel> = Box::new(bench.scope());
            (generator, scope)
        }
        None => (
            connect("generator", &config.generator).await?,
            connect("scope", &config.scope).await?,
        ),
    };

    let (cancel, token) = CancelToken::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current point");
            cancel.cancel();
        }
    });

    let mut engine = SweepEngine::new(generator, scope, config.sweep.clone())?.with_cancel(token);
    tracing::info!(
        points = engine.plan().len(),
        start_hz = config.sweep.start_freq_hz,
        end_hz = config.sweep.end_freq_hz,
        "Starting sweep"
    );

    match engine.run().await {
        Ok(result) => {
            print_table(&result);
            save(cli.csv.as_ref(), &result)?;
            Ok(())
        }
        Err(fault) => {
            print_table(&fault.partial);
            save(cli.csv.as_ref(), &fault.partial)?;
            Err(anyhow::Error::new(fault).context("Sweep did not complete"))
        }
    }
}

async fn connect(name: &str, endpoint: &EndpointConfig) -> Result<Box<dyn InstrumentChannel>> {
    let Some(address) = endpoint.address.as_deref() else {
        bail!("No {name} address; pass --{name} or set [{name}] address, or use --simulate");
    };
    let channel = TcpChannel::connect(address)
        .await
        .with_context(|| format!("Failed to connect to {} at {}", name, address))?
        .with_timeout(endpoint.timeout());
    Ok(Box::new(channel))
}

fn print_table(result: &SweepResult) {
    println!(
        "{:>12}  {:>10}  {:>10}  {:>8}  {:>8}",
        "Freq", "Vpp 1", "Vpp 2", "dBV", "Phase"
    );
    for s in result {
        println!(
            "{:>12.2}  {:>10.4}  {:>10.4}  {:>8.2}  {:>8.2}",
            s.frequency_hz, s.vpp_in, s.vpp_out, s.gain_db, s.phase_deg
        );
    }
    for f in &result.skipped {
        println!("{:>12.2}  skipped", f);
    }
}

fn save(path: Option<&PathBuf>, result: &SweepResult) -> Result<()> {
    if let Some(path) = path {
        let written = storage::write_csv(path, &result.samples)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {} samples to {}", result.len(), written.display());
    }
    Ok(())
}
