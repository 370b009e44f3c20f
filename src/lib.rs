//! # Bode Sweep
//!
//! Frequency-response measurement for a bench made of a Siglent SDG function generator
//! and a Siglent SDS1000X-U oscilloscope. The generator drives the device under test with
//! a sine; the oscilloscope probes its input and output. For each frequency of a
//! log-spaced plan the sweep reads both peak-to-peak voltages and the phase difference
//! and reduces them to a gain/phase sample.
//!
//! ## Crate Structure
//!
//! - **`channel`**: the [`channel::InstrumentChannel`] transport trait, with a TCP
//!   implementation, a scripted mock and a simulated bench.
//! - **`scope`**: oscilloscope measurement adapter. Knows the firmware defects and keeps
//!   them away from the rest of the crate.
//! - **`generator`**: function generator controller.
//! - **`sweep`**: frequency plan, sample reducer and the sweep scheduler.
//! - **`error`**: instrument, measurement and engine fault types.
//! - **`config`**: layered bench configuration (TOML file and `BODE_` environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`storage`**: CSV output of sweep results.

pub mod channel;
pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod scope;
pub mod storage;
pub mod sweep;

pub use error::{EngineFault, EngineFaultKind, InstrumentError, MeasurementFault};
pub use sweep::{run_sweep, MeasurementSample, SweepConfig, SweepEngine, SweepResult};
