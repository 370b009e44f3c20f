//! Bench configuration using Figment
//!
//! Configuration is layered from:
//! 1. built-in defaults (the usual bench wiring: input on C1, output on C2, generator C1)
//! 2. a TOML file, `bode.toml` unless another path is given
//! 3. environment variables prefixed with `BODE_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use bode_sweep::config::BenchConfig;
//!
//! // BODE_SWEEP__QUALITY=4 overrides [sweep] quality
//! let config = BenchConfig::load()?;
//! config.validate()?;
//! println!("{} .. {} Hz", config.sweep.start_freq_hz, config.sweep.end_freq_hz);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::channel::tcp::DEFAULT_TIMEOUT_MS;
use crate::sweep::SweepConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file
pub const DEFAULT_CONFIG_FILE: &str = "bode.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BODE_";

/// Top-level bench configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Oscilloscope connection
    pub scope: EndpointConfig,
    /// Function generator connection
    pub generator: EndpointConfig,
    /// Sweep parameters
    pub sweep: SweepConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Network location of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `host` or `host:port`; `None` when not configured
    pub address: Option<String>,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl EndpointConfig {
    /// Response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BenchConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider, for callers that merge further sources on top.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render as TOML, e.g. to start a new configuration file from the effective settings.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        for (name, endpoint) in [("scope", &self.scope), ("generator", &self.generator)] {
            if endpoint.timeout_ms == 0 {
                return Err(format!("{}.timeout_ms must be positive", name));
            }
            if matches!(&endpoint.address, Some(a) if a.trim().is_empty()) {
                return Err(format!("{}.address is empty", name));
            }
        }

        self.sweep.validate().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::{FaultPolicy, Quality};
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let config = BenchConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, BenchConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep.in_channel, 1);
        assert_eq!(config.sweep.out_channel, 2);
        assert_eq!(config.sweep.in_attenuation, 10.0);
        assert_eq!(config.scope.timeout(), Duration::from_millis(2000));
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [scope]
            address = "192.168.1.21"

            [sweep]
            start_freq_hz = 20.0
            end_freq_hz = 20000.0
            quality = 3
            on_fault = "skip"
            "#,
        );

        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.scope.address.as_deref(), Some("192.168.1.21"));
        assert_eq!(config.generator.address, None);
        assert_eq!(config.sweep.start_freq_hz, 20.0);
        assert_eq!(config.sweep.quality, Quality::new(3).unwrap());
        assert_eq!(config.sweep.on_fault, FaultPolicy::Skip);
        // untouched keys keep their defaults
        assert_eq!(config.sweep.amplitude_vpp, 1.0);
        assert!(config.sweep.autoscale);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_quality_out_of_range_rejected_at_load() {
        let file = write_config("[sweep]\nquality = 11\n");
        assert!(BenchConfig::load_from(file.path()).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[sweep]\nquality = 2\ndelay_secs = 0.5\n");
        std::env::set_var("BODE_SWEEP__QUALITY", "5");
        std::env::set_var("BODE_GENERATOR__ADDRESS", "awg.lab:5025");

        let result = BenchConfig::load_from(file.path());

        std::env::remove_var("BODE_SWEEP__QUALITY");
        std::env::remove_var("BODE_GENERATOR__ADDRESS");

        let config = result.unwrap();
        assert_eq!(config.sweep.quality.level(), 5);
        assert_eq!(config.sweep.delay_secs, 0.5);
        assert_eq!(config.generator.address.as_deref(), Some("awg.lab:5025"));
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let mut config = BenchConfig::default();
        config.scope.address = Some("10.0.0.5:5025".to_string());
        config.sweep.quality = Quality::new(6).unwrap();

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[sweep]"));
        assert!(rendered.contains("quality = 6"));

        let loaded: BenchConfig = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BenchConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sweep_section() {
        let mut config = BenchConfig::default();
        config.sweep.start_freq_hz = 200_000.0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("start frequency"), "{}", err);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = BenchConfig::default();
        config.scope.timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
