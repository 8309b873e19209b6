//! Correlator configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RT_CORR_`, nested keys separated
//!    by `__` (e.g. `RT_CORR_POOL__OVERSUBSCRIPTION=4`)
//!
//! Every section except `[array]` has defaults, and [`CorrelatorConfig`]
//! itself implements `Default` (3 antennas, 4 channels, 1 beam) so tests and
//! the simulator run without a file.
//!
//! # Example
//! ```no_run
//! use rt_correlator::config::CorrelatorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CorrelatorConfig::load_from("config/correlator.toml")?;
//! config.validate()?;
//! println!("pool capacity: {}", config.pool_dimensions().capacity());
//! # Ok(())
//! # }
//! ```

use crate::delay::{DelayMode, DEFAULT_UNWRAP_THRESHOLD};
use crate::error::{CorrError, CorrResult};
use corr_pool::PoolDimensions;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// Top-level correlator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Array geometry as seen by the correlator
    pub array: ArrayConfig,
    /// Buffer pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
    /// Monitoring history
    #[serde(default)]
    pub history: HistoryConfig,
    /// Delay estimation
    #[serde(default)]
    pub delay: DelayConfig,
    /// Diagnostic output locations
    #[serde(default)]
    pub output: OutputConfig,
    /// Integration settings
    #[serde(default)]
    pub correlator: IntegrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Antenna, channel and beam counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayConfig {
    /// Number of antennas (at least 2)
    pub antennas: usize,
    /// Number of channels (cards)
    pub channels: usize,
    /// Number of beams
    pub beams: usize,
    /// Complex samples per ingest buffer
    pub samples_per_buffer: usize,
    /// Frequency spacing between adjacent channels in Hz
    pub channel_spacing_hz: f64,
}

/// Buffer pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Buffers per antenna/channel/beam combination
    #[serde(default = "default_oversubscription")]
    pub oversubscription: usize,
}

/// Monitoring history configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Number of integration cycles retained
    #[serde(default = "default_history_depth")]
    pub depth: usize,
    /// Beam dimension of the history; beams beyond it are not recorded
    #[serde(default = "default_max_beams")]
    pub max_beams: usize,
}

/// Delay estimator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Estimation method
    #[serde(default)]
    pub mode: DelayMode,
    /// Adjacent-channel phase jump that triggers a 2π correction
    #[serde(default = "default_unwrap_threshold")]
    pub unwrap_threshold_rad: f64,
    /// Zero-padding factor for the lag transform (power of two)
    #[serde(default = "default_lag_padding")]
    pub lag_padding: usize,
}

/// Diagnostic output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for snapshots and the history table
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    /// File name prefix of per-beam spectrum snapshots
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    /// File name of the history table
    #[serde(default = "default_history_file")]
    pub history_file: String,
}

/// Integration cycle configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Matched antenna-sets accumulated per (channel, beam) per cycle
    #[serde(default = "default_integration_buffers")]
    pub integration_buffers: usize,
    /// Integer sample shift per baseline; missing entries are 0
    #[serde(default)]
    pub baseline_delays: Vec<i64>,
}

// Default value functions
fn default_name() -> String {
    "rt-correlator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_oversubscription() -> usize {
    3
}

fn default_history_depth() -> usize {
    256
}

fn default_max_beams() -> usize {
    4
}

fn default_unwrap_threshold() -> f64 {
    DEFAULT_UNWRAP_THRESHOLD
}

fn default_lag_padding() -> usize {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_snapshot_prefix() -> String {
    "spectrum".to_string()
}

fn default_history_file() -> String {
    "history.txt".to_string()
}

fn default_integration_buffers() -> usize {
    1
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            antennas: 3,
            channels: 4,
            beams: 1,
            samples_per_buffer: 1024,
            channel_spacing_hz: 1.0e6,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            oversubscription: default_oversubscription(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            depth: default_history_depth(),
            max_beams: default_max_beams(),
        }
    }
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            mode: DelayMode::default(),
            unwrap_threshold_rad: default_unwrap_threshold(),
            lag_padding: default_lag_padding(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            snapshot_prefix: default_snapshot_prefix(),
            history_file: default_history_file(),
        }
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            array: ArrayConfig::default(),
            pool: PoolConfig::default(),
            history: HistoryConfig::default(),
            delay: DelayConfig::default(),
            output: OutputConfig::default(),
            correlator: IntegrationConfig {
                integration_buffers: default_integration_buffers(),
                baseline_delays: Vec::new(),
            },
        }
    }
}

impl CorrelatorConfig {
    /// Load configuration from a TOML file and `RT_CORR_` environment
    /// variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CorrResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RT_CORR_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> CorrResult<Self> {
        let config = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> CorrResult<String> {
        toml::to_string_pretty(self).map_err(|e| CorrError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CorrResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CorrError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let array = &self.array;
        if array.antennas < 2 {
            return Err(CorrError::Configuration(format!(
                "array.antennas must be at least 2, got {}",
                array.antennas
            )));
        }
        for (name, value) in [
            ("array.channels", array.channels),
            ("array.beams", array.beams),
            ("array.samples_per_buffer", array.samples_per_buffer),
            ("pool.oversubscription", self.pool.oversubscription),
            ("history.depth", self.history.depth),
            ("history.max_beams", self.history.max_beams),
            ("correlator.integration_buffers", self.correlator.integration_buffers),
        ] {
            if value == 0 {
                return Err(CorrError::Configuration(format!("{name} must be > 0")));
            }
        }
        if !(array.channel_spacing_hz.is_finite() && array.channel_spacing_hz > 0.0) {
            return Err(CorrError::Configuration(format!(
                "array.channel_spacing_hz must be positive, got {}",
                array.channel_spacing_hz
            )));
        }

        let threshold = self.delay.unwrap_threshold_rad;
        if !(threshold > PI && threshold < 2.0 * PI) {
            return Err(CorrError::Configuration(format!(
                "delay.unwrap_threshold_rad must lie in (π, 2π), got {threshold}"
            )));
        }
        if !self.delay.lag_padding.is_power_of_two() {
            return Err(CorrError::Configuration(format!(
                "delay.lag_padding must be a power of two, got {}",
                self.delay.lag_padding
            )));
        }

        let baselines = self.baseline_count();
        if self.correlator.baseline_delays.len() > baselines {
            return Err(CorrError::Configuration(format!(
                "correlator.baseline_delays has {} entries but the array has {} baselines",
                self.correlator.baseline_delays.len(),
                baselines
            )));
        }
        if let Some(delay) = self
            .correlator
            .baseline_delays
            .iter()
            .find(|d| d.unsigned_abs() as usize >= array.samples_per_buffer)
        {
            return Err(CorrError::Configuration(format!(
                "baseline delay {delay} leaves no overlap in a {}-sample buffer",
                array.samples_per_buffer
            )));
        }

        Ok(())
    }

    /// Number of antenna pairs.
    #[must_use]
    pub fn baseline_count(&self) -> usize {
        self.array.antennas * self.array.antennas.saturating_sub(1) / 2
    }

    /// Integer sample shift for every baseline, padded with zeros.
    #[must_use]
    pub fn baseline_delays(&self) -> Vec<i64> {
        let mut delays = self.correlator.baseline_delays.clone();
        delays.resize(self.baseline_count(), 0);
        delays
    }

    /// Pool shape derived from the array and pool sections.
    #[must_use]
    pub fn pool_dimensions(&self) -> PoolDimensions {
        PoolDimensions {
            antennas: self.array.antennas,
            channels: self.array.channels,
            beams: self.array.beams,
            samples_per_buffer: self.array.samples_per_buffer,
            oversubscription: self.pool.oversubscription,
        }
    }

    /// Path of the history table.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.output.directory.join(&self.output.history_file)
    }
}
