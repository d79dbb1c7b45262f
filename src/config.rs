//! Configuration for the `irq-relay` binary, loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. the TOML file given on the command line
//! 2. environment variables prefixed with `IRQ_RELAY_`, with `__` between
//!    section and key (e.g. `IRQ_RELAY_PIPELINE__DELAY_MS=50`)
//!
//! # Example
//! ```no_run
//! use irq_relay::config::RelayConfig;
//!
//! let config = RelayConfig::load_from("config/relay.toml")?;
//! config.validate()?;
//! println!("Relaying to {}", config.pipeline.destination);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use relay_core::{ConfigField, ConfigState};
use relay_device::{DeviceOptions, FileSinkOpener};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "IRQ_RELAY_";

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Logging and identity
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Buffer sizing and shutdown policy
    #[serde(default)]
    pub device: DeviceConfig,
    /// Values programmed into the device before start
    pub pipeline: PipelineConfig,
    /// Timer event source
    #[serde(default)]
    pub trigger: TriggerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Device name used in diagnostics
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Device construction options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Data channel capacity in bytes
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Entries per log stream
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Flush jobs allowed to queue behind the running one
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
    /// Budget for stop (flush join, drain and sink close), in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Abandon pending flushes on stop instead of completing them
    #[serde(default = "default_true")]
    pub interrupt_flush_on_stop: bool,
}

/// Pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Event line to trigger on
    pub irq_id: i32,
    /// Sink destination path
    pub destination: String,
    /// Delay between an event and its flush, in milliseconds
    #[serde(default)]
    pub delay_ms: u32,
    /// Maximum bytes per flush
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Flush leftovers on stop instead of discarding them
    #[serde(default)]
    pub keep_missed: bool,
    /// Create the destination if it does not exist
    #[serde(default = "default_true")]
    pub create_destination: bool,
    /// Append to the destination instead of truncating it
    #[serde(default)]
    pub append: bool,
}

/// Timer trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Interval between events, in milliseconds
    #[serde(default = "default_period")]
    pub period_ms: u64,
    /// Trigger periods without a flushed byte before a run stops waiting
    #[serde(default = "default_stall_periods")]
    pub stall_periods: u32,
}

// Default value functions
fn default_name() -> String {
    "irq-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_channel_capacity() -> usize {
    relay_core::DEFAULT_CHANNEL_CAPACITY
}

fn default_log_capacity() -> usize {
    relay_core::DEFAULT_LOG_CAPACITY
}

fn default_dispatch_queue() -> usize {
    64
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_chunk_size() -> usize {
    relay_core::DEFAULT_CHUNK_SIZE
}

fn default_period() -> u64 {
    100
}

fn default_stall_periods() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            log_capacity: default_log_capacity(),
            dispatch_queue: default_dispatch_queue(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            interrupt_flush_on_stop: true,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period(),
            stall_periods: default_stall_periods(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file plus environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
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
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.device_options()
            .validate()
            .map_err(|e| format!("Invalid [device] section: {}", e))?;

        if self.trigger.period_ms == 0 {
            return Err("Invalid trigger period_ms 0. Must be greater than 0".to_string());
        }
        if self.trigger.stall_periods == 0 {
            return Err("Invalid trigger stall_periods 0. Must be greater than 0".to_string());
        }

        // Run the pipeline values through the same checks the device applies
        let mut scratch = ConfigState::new();
        for field in self.config_fields() {
            scratch
                .set(field)
                .map_err(|e| format!("Invalid [pipeline] section: {}", e))?;
        }

        Ok(())
    }

    /// Device construction options
    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions::default()
            .channel_capacity(self.device.channel_capacity)
            .log_capacity(self.device.log_capacity)
            .dispatch_queue(self.device.dispatch_queue)
            .shutdown_timeout(Duration::from_millis(self.device.shutdown_timeout_ms))
            .interrupt_flush_on_stop(self.device.interrupt_flush_on_stop)
    }

    /// The configuration commands to issue before start, in order
    pub fn config_fields(&self) -> Vec<ConfigField> {
        let pipeline = &self.pipeline;
        vec![
            ConfigField::EventSource(pipeline.irq_id),
            ConfigField::Delay(pipeline.delay_ms),
            ConfigField::ChunkSize(pipeline.chunk_size),
            ConfigField::Path(pipeline.destination.clone()),
            ConfigField::KeepMissed(pipeline.keep_missed),
        ]
    }

    /// File sink opener matching the destination flags
    pub fn sink_opener(&self) -> FileSinkOpener {
        FileSinkOpener::new()
            .create(self.pipeline.create_destination)
            .truncate(!self.pipeline.append)
            .append(self.pipeline.append)
    }

    /// Interval of the timer event source
    pub fn trigger_period(&self) -> Duration {
        Duration::from_millis(self.trigger.period_ms)
    }
}
