//! Device configuration and its run-state machine.
//!
//! ```text
//!   Unconfigured ──set irq + path──▶ Configured ──start──▶ Running
//!                                        ▲                    │
//!                                        └────────stop────────┘
//! ```
//!
//! Every field is writable in both stopped states and frozen while running.
//! `start` needs an event line and a destination path; delay, chunk size and
//! the keep-missed flag have usable defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{RelayError, Result};

/// Destination paths must fit in `PATH_MAX_LEN - 1` bytes.
pub const PATH_MAX_LEN: usize = 128;

/// Upper bound on the flush delay.
pub const MAX_DELAY_MS: u32 = 60_000;

/// Upper bound on the chunk flushed per event.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Chunk size used until one is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Subtracted from the delay to account for dispatch and wake-up latency.
pub const SCHEDULING_CORRECTION: Duration = Duration::from_micros(100);

/// Where the device sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Stopped; event line or destination still missing.
    Unconfigured,
    /// Stopped; ready to start.
    Configured,
    /// Accepting events and flushing.
    Running,
}

impl DeviceState {
    /// True in either stopped state.
    pub fn is_stopped(self) -> bool {
        !matches!(self, DeviceState::Running)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Unconfigured => "stopped (unconfigured)",
            DeviceState::Configured => "stopped (configured)",
            DeviceState::Running => "running",
        };
        f.write_str(label)
    }
}

/// One configuration command, as issued by a control client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigField {
    /// Event line to listen on (must be non-negative).
    EventSource(i32),
    /// Delay between the event and the flush, in milliseconds.
    Delay(u32),
    /// Maximum bytes flushed per event.
    ChunkSize(usize),
    /// Destination the sink is opened at.
    Path(String),
    /// Flush leftovers on stop instead of discarding them.
    KeepMissed(bool),
}

impl ConfigField {
    fn name(&self) -> &'static str {
        match self {
            ConfigField::EventSource(_) => "irq_id",
            ConfigField::Delay(_) => "delay_ms",
            ConfigField::ChunkSize(_) => "chunk_size",
            ConfigField::Path(_) => "destination_path",
            ConfigField::KeepMissed(_) => "keep_missed",
        }
    }
}

/// Values frozen at `start` and handed to the running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    /// Claimed event line.
    pub irq_id: u32,
    /// Configured delay before each flush.
    pub delay: Duration,
    /// Upper bound on bytes per flush.
    pub chunk_size: usize,
    /// Sink destination.
    pub destination_path: String,
    /// Drain policy applied at stop.
    pub keep_missed: bool,
}

impl RunParams {
    /// Delay actually slept by a flush cycle.
    pub fn corrected_delay(&self) -> Duration {
        self.delay.saturating_sub(SCHEDULING_CORRECTION)
    }
}

/// Configuration fields plus the running flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigState {
    irq_id: Option<u32>,
    delay_ms: u32,
    chunk_size: usize,
    destination_path: Option<String>,
    keep_missed: bool,
    running: bool,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            irq_id: None,
            delay_ms: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            destination_path: None,
            keep_missed: false,
            running: false,
        }
    }
}

impl ConfigState {
    /// Fresh, unconfigured state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        if self.running {
            DeviceState::Running
        } else if self.irq_id.is_some() && self.destination_path.is_some() {
            DeviceState::Configured
        } else {
            DeviceState::Unconfigured
        }
    }

    /// Event line, if configured.
    pub fn irq_id(&self) -> Option<u32> {
        self.irq_id
    }

    /// Flush delay in milliseconds.
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// Bytes per flush.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Sink destination, if configured.
    pub fn destination_path(&self) -> Option<&str> {
        self.destination_path.as_deref()
    }

    /// Whether stop flushes leftover bytes instead of discarding them.
    pub fn keep_missed(&self) -> bool {
        self.keep_missed
    }

    /// Apply one configuration command.
    ///
    /// # Errors
    /// - `Busy` while running
    /// - `InvalidArgument` if the value is out of range; nothing is changed
    pub fn set(&mut self, field: ConfigField) -> Result<()> {
        if self.running {
            return Err(RelayError::busy(format!(
                "cannot change {} while running",
                field.name()
            )));
        }

        debug!(field = field.name(), value = ?field, "Configuring");

        match field {
            ConfigField::EventSource(id) => {
                let id = u32::try_from(id)
                    .map_err(|_| RelayError::invalid("irq_id", format!("{} is negative", id)))?;
                self.irq_id = Some(id);
            }
            ConfigField::Delay(ms) => {
                if ms > MAX_DELAY_MS {
                    return Err(RelayError::invalid(
                        "delay_ms",
                        format!("{} exceeds the {} ms limit", ms, MAX_DELAY_MS),
                    ));
                }
                self.delay_ms = ms;
            }
            ConfigField::ChunkSize(size) => {
                if size == 0 {
                    return Err(RelayError::invalid("chunk_size", "must be greater than 0"));
                }
                if size > MAX_CHUNK_SIZE {
                    return Err(RelayError::invalid(
                        "chunk_size",
                        format!("{} exceeds the {} byte limit", size, MAX_CHUNK_SIZE),
                    ));
                }
                self.chunk_size = size;
            }
            ConfigField::Path(path) => {
                validate_path(&path)?;
                self.destination_path = Some(path);
            }
            ConfigField::KeepMissed(keep) => {
                self.keep_missed = keep;
            }
        }
        Ok(())
    }

    /// Check that `start` is legal and freeze the parameters.
    ///
    /// Does not change state; call [`mark_running`](Self::mark_running) once
    /// the event source and sink have been acquired.
    pub fn run_params(&self) -> Result<RunParams> {
        if self.running {
            return Err(RelayError::busy("device is already running"));
        }
        let (Some(irq_id), Some(path)) = (self.irq_id, self.destination_path.as_ref()) else {
            return Err(RelayError::invalid(
                "configuration",
                "event source and destination path must be set before start",
            ));
        };

        Ok(RunParams {
            irq_id,
            delay: Duration::from_millis(u64::from(self.delay_ms)),
            chunk_size: self.chunk_size,
            destination_path: path.clone(),
            keep_missed: self.keep_missed,
        })
    }

    /// Enter `Running`.
    pub fn mark_running(&mut self) {
        self.running = true;
    }

    /// Check that `stop` is legal.
    pub fn ensure_running(&self) -> Result<()> {
        if !self.running {
            return Err(RelayError::busy("device is not running"));
        }
        Ok(())
    }

    /// Leave `Running`.
    pub fn mark_stopped(&mut self) {
        self.running = false;
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(RelayError::invalid("destination_path", "must not be empty"));
    }
    if path.len() > PATH_MAX_LEN - 1 {
        return Err(RelayError::invalid(
            "destination_path",
            format!("{} bytes exceeds the {} byte limit", path.len(), PATH_MAX_LEN - 1),
        ));
    }
    if path.contains('\0') {
        return Err(RelayError::invalid(
            "destination_path",
            "must not contain NUL bytes",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn configured() -> ConfigState {
        let mut config = ConfigState::new();
        config.set(ConfigField::EventSource(1)).unwrap();
        config.set(ConfigField::Path("/tmp/out".into())).unwrap();
        config
    }

    #[test]
    fn test_state_transitions() {
        let mut config = ConfigState::new();
        assert_eq!(config.state(), DeviceState::Unconfigured);

        config.set(ConfigField::EventSource(4)).unwrap();
        assert_eq!(config.state(), DeviceState::Unconfigured);

        config.set(ConfigField::Path("/tmp/out".into())).unwrap();
        assert_eq!(config.state(), DeviceState::Configured);

        config.mark_running();
        assert_eq!(config.state(), DeviceState::Running);

        config.mark_stopped();
        assert_eq!(config.state(), DeviceState::Configured);
    }

    #[test]
    fn test_fields_frozen_while_running() {
        let mut config = configured();
        config.mark_running();

        let err = config.set(ConfigField::Delay(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        let err = config.set(ConfigField::KeepMissed(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(config.delay_ms(), 0);
    }

    #[test]
    fn test_validation() {
        let mut config = ConfigState::new();

        let err = config.set(ConfigField::EventSource(-1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(config.irq_id(), None);

        assert!(config.set(ConfigField::ChunkSize(0)).is_err());
        assert!(config.set(ConfigField::ChunkSize(MAX_CHUNK_SIZE + 1)).is_err());
        assert_eq!(config.chunk_size(), DEFAULT_CHUNK_SIZE);

        assert!(config.set(ConfigField::Delay(MAX_DELAY_MS + 1)).is_err());

        assert!(config.set(ConfigField::Path(String::new())).is_err());
        assert!(config.set(ConfigField::Path("a".repeat(PATH_MAX_LEN))).is_err());
        config
            .set(ConfigField::Path("a".repeat(PATH_MAX_LEN - 1)))
            .unwrap();
    }

    #[test]
    fn test_run_params_requires_configuration() {
        let config = ConfigState::new();
        let err = config.run_params().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut config = configured();
        config.set(ConfigField::Delay(50)).unwrap();
        config.set(ConfigField::ChunkSize(5)).unwrap();
        let params = config.run_params().unwrap();
        assert_eq!(params.irq_id, 1);
        assert_eq!(params.chunk_size, 5);
        assert_eq!(params.delay, Duration::from_millis(50));

        config.mark_running();
        assert!(config.run_params().unwrap_err().is_busy());
    }

    #[test]
    fn test_ensure_running() {
        let mut config = configured();
        assert!(config.ensure_running().unwrap_err().is_busy());
        config.mark_running();
        assert!(config.ensure_running().is_ok());
    }

    #[test]
    fn test_corrected_delay_clamps() {
        let mut config = configured();
        let params = config.run_params().unwrap();
        assert_eq!(params.corrected_delay(), Duration::ZERO);

        config.set(ConfigField::Delay(50)).unwrap();
        let params = config.run_params().unwrap();
        assert_eq!(
            params.corrected_delay(),
            Duration::from_millis(50) - SCHEDULING_CORRECTION
        );
    }
}
