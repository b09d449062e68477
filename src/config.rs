//! Scan configuration using Figment
//!
//! Configuration is layered from:
//! 1. A TOML file (`config/scan.toml` by default)
//! 2. Environment variables prefixed with `SPECTRO_SCAN__`, nested with `__`
//!
//! Every section except `[application]` may be omitted; missing fields take
//! the defaults below.
//!
//! # Example
//! ```no_run
//! use spectro_scan::config::ScanConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load_from("config/scan.toml")?;
//! config.validate()?;
//! println!("trigger lead: {:?}", config.timing.trigger_lead());
//! # Ok(())
//! # }
//! ```
//!
//! Override a single field from the shell:
//! `SPECTRO_SCAN__NETWORK__MAX_RETRIES=5 spectro-scan controller ...`

use crate::error::{AppResult, ScanError};
use crate::scan::gate::StabilityThresholds;
use crate::validation::{is_in_range, is_not_empty, is_positive, is_valid_endpoint, is_valid_path};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPECTRO_SCAN__";

/// Allowed range for the TRIG lead time, in milliseconds.
pub const TRIGGER_LEAD_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=150;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Link to the peer node
    #[serde(default)]
    pub network: NetworkConfig,
    /// Handshake and acquisition timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Stability thresholds for the validation gate
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Voltage output limits
    #[serde(default)]
    pub actuation: ActuationConfig,
    /// Sampling style per node
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Retry ledger location
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the controller listens on and the analyzer connects to
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Wait for each reply before re-sending, in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Re-sends of an unanswered request before the step is escalated
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait for the analyzer's READY, in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    /// Ask the analyzer for its raw samples after every FIN
    #[serde(default)]
    pub request_raw: bool,
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Lead between TRIG and the synchronized start, in milliseconds
    #[serde(default = "default_trigger_lead")]
    pub trigger_lead_ms: u64,
    /// Length of each acquisition window, in milliseconds
    #[serde(default = "default_window")]
    pub acquisition_window_ms: u32,
    /// Settling time after the output reaches its setpoint, in milliseconds
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Period of the interval scheduler, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Wait between unregistering a callback and freezing its queue
    #[serde(default = "default_quiescence")]
    pub quiescence_ms: u64,
}

/// Stability thresholds (strict upper bounds on stddev)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Frequency stddev bound in Hz
    #[serde(default = "default_freq_threshold")]
    pub freq_stddev: f64,
    /// Intensity stddev bound in volts
    #[serde(default = "default_intensity_threshold")]
    pub intensity_stddev: f64,
}

/// Actuation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuationConfig {
    /// Absolute output limit in volts
    #[serde(default = "default_voltage_limit")]
    pub voltage_limit: f64,
    /// Ramp rate in V/s used for every setpoint change
    #[serde(default = "default_ramp_rate")]
    pub max_ramp_rate: f64,
}

/// Sampling style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Fixed-period polling
    #[default]
    Interval,
    /// Device-pushed events
    Event,
}

/// What the wavemeter reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavemeterReadout {
    /// Optical frequency in Hz
    #[default]
    Frequency,
    /// Vacuum wavelength in nm, converted to Hz on acquisition
    Wavelength,
}

/// Acquisition configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Frequency reference sampling on the controller
    #[serde(default)]
    pub controller_mode: AcquisitionMode,
    /// Intensity sampling on the analyzer
    #[serde(default)]
    pub analyzer_mode: AcquisitionMode,
    /// Wavemeter output units
    #[serde(default)]
    pub wavemeter_readout: WavemeterReadout,
}

/// Retry ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON Lines file of failed steps
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_endpoint() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_reply_timeout() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_ready_timeout() -> u64 {
    10_000
}

fn default_trigger_lead() -> u64 {
    120
}

fn default_window() -> u32 {
    3_000
}

fn default_settle() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    100
}

fn default_quiescence() -> u64 {
    20
}

fn default_freq_threshold() -> f64 {
    50.0e6
}

fn default_intensity_threshold() -> f64 {
    0.05
}

fn default_voltage_limit() -> f64 {
    10.0
}

fn default_ramp_rate() -> f64 {
    10.0
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("failed_steps.jsonl")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            reply_timeout_ms: default_reply_timeout(),
            max_retries: default_max_retries(),
            ready_timeout_ms: default_ready_timeout(),
            request_raw: false,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            trigger_lead_ms: default_trigger_lead(),
            acquisition_window_ms: default_window(),
            settle_ms: default_settle(),
            poll_interval_ms: default_poll_interval(),
            quiescence_ms: default_quiescence(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            freq_stddev: default_freq_threshold(),
            intensity_stddev: default_intensity_threshold(),
        }
    }
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            voltage_limit: default_voltage_limit(),
            max_ramp_rate: default_ramp_rate(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

impl NetworkConfig {
    /// Reply timeout as a `Duration`.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// READY timeout as a `Duration`.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl TimingConfig {
    /// TRIG lead as a `Duration`.
    pub fn trigger_lead(&self) -> Duration {
        Duration::from_millis(self.trigger_lead_ms)
    }

    /// Acquisition window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(u64::from(self.acquisition_window_ms))
    }

    /// Settling time as a `Duration`.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Poll period as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Callback quiescence as a `Duration`.
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}

impl ThresholdConfig {
    /// Thresholds in the form the validation gate takes.
    pub fn stability(&self) -> StabilityThresholds {
        StabilityThresholds {
            freq_stddev: self.freq_stddev,
            intensity_stddev: self.intensity_stddev,
        }
    }
}

impl ScanConfig {
    /// Load configuration from `config/scan.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/scan.toml")
    }

    /// Load configuration from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(ScanError::from)
    }

    /// The provider stack, exposed so callers can merge extra layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |field: &str, reason: &str| {
            ScanError::Configuration(format!("{field}: {reason}"))
        };

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        is_not_empty(&self.application.name).map_err(|e| fail("application.name", e))?;

        is_valid_endpoint(&self.network.endpoint).map_err(|e| fail("network.endpoint", e))?;
        is_positive(self.network.reply_timeout_ms as f64)
            .map_err(|e| fail("network.reply_timeout_ms", e))?;
        is_positive(self.network.ready_timeout_ms as f64)
            .map_err(|e| fail("network.ready_timeout_ms", e))?;

        is_in_range(self.timing.trigger_lead_ms, TRIGGER_LEAD_RANGE_MS)
            .map_err(|e| fail("timing.trigger_lead_ms", e))?;
        is_positive(f64::from(self.timing.acquisition_window_ms))
            .map_err(|e| fail("timing.acquisition_window_ms", e))?;
        is_positive(self.timing.poll_interval_ms as f64)
            .map_err(|e| fail("timing.poll_interval_ms", e))?;

        is_positive(self.thresholds.freq_stddev).map_err(|e| fail("thresholds.freq_stddev", e))?;
        is_positive(self.thresholds.intensity_stddev)
            .map_err(|e| fail("thresholds.intensity_stddev", e))?;

        is_positive(self.actuation.voltage_limit)
            .map_err(|e| fail("actuation.voltage_limit", e))?;
        is_positive(self.actuation.max_ramp_rate)
            .map_err(|e| fail("actuation.max_ramp_rate", e))?;

        is_valid_path(&self.ledger.path.to_string_lossy()).map_err(|e| fail("ledger.path", e))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config() -> ScanConfig {
        minimal()
    }

    fn minimal() -> ScanConfig {
        ScanConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
                log_format: LogFormat::Compact,
            },
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            thresholds: ThresholdConfig::default(),
            actuation: ActuationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.max_retries, 3);
        assert_eq!(config.timing.trigger_lead(), Duration::from_millis(120));
        assert_eq!(config.acquisition.analyzer_mode, AcquisitionMode::Interval);
        assert_eq!(config.acquisition.wavemeter_readout, WavemeterReadout::Frequency);
    }

    #[test]
    fn invalid_log_level() {
        let mut config = minimal();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn trigger_lead_outside_window_is_rejected() {
        for lead in [99, 151, 0] {
            let mut config = minimal();
            config.timing.trigger_lead_ms = lead;
            assert!(config.validate().is_err(), "lead {lead} accepted");
        }
        let mut config = minimal();
        config.timing.trigger_lead_ms = 150;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_positive_threshold_is_rejected() {
        let mut config = minimal();
        config.thresholds.intensity_stddev = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("thresholds.intensity_stddev"));
    }

    #[test]
    fn endpoint_must_be_socket_address() {
        let mut config = minimal();
        config.network.endpoint = "localhost".to_string();
        assert!(config.validate().is_err());
        config.network.endpoint = "10.0.0.2:0".to_string();
        assert!(config.validate().is_err());
    }
}
