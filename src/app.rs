//! One relay run, as driven by the `run` subcommand.
//!
//! Builds a device with a timer event source and a file sink, programs it
//! from [`RelayConfig`], feeds it the input bytes, waits until the channel
//! has been flushed, closes it and collects the merged logs. Waiting ends
//! early on Ctrl-C, or once `trigger.stall_periods` periods pass without a
//! byte reaching the sink.

use anyhow::{Context, Result};
use relay_core::{AnnotatedEntry, LogSortKey};
use relay_device::{Device, DeviceSession, DeviceStats, TimerEventSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RelayConfig;

/// Knobs of a single run that do not belong in the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// File whose bytes are relayed. Nothing is written if absent.
    pub input: Option<PathBuf>,
    /// Retry until the channel has accepted every input byte.
    pub block: bool,
    /// Order of the merged log view in the report.
    pub sort: LogSortKey,
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Input bytes the channel accepted.
    pub accepted: usize,
    /// Bytes written by the final drain on close.
    pub drained: usize,
    /// The run was cut short by Ctrl-C or a stalled drain.
    pub interrupted: bool,
    /// All three log streams, merged.
    pub logs: Vec<AnnotatedEntry>,
    /// Counters taken after close.
    pub stats: DeviceStats,
}

/// Build the device described by `config`.
pub fn build_device(config: &RelayConfig) -> Device {
    Device::new(
        config.application.name.clone(),
        config.device_options(),
        Arc::new(TimerEventSource::new(config.trigger_period())),
        Arc::new(config.sink_opener()),
    )
}

/// Execute one run end to end.
pub async fn run(config: &RelayConfig, options: &RunOptions) -> Result<RunReport> {
    run_on(build_device(config), config, options).await
}

/// Execute one run on an already built device.
pub async fn run_on(
    device: Device,
    config: &RelayConfig,
    options: &RunOptions,
) -> Result<RunReport> {
    let period = config.trigger_period();
    let stall_periods = config.trigger.stall_periods;
    let session = device.open().context("Failed to open relay device")?;

    for field in config.config_fields() {
        session
            .configure(field.clone())
            .await
            .with_context(|| format!("Failed to apply {:?}", field))?;
    }

    let input = match &options.input {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read input {}", path.display()))?,
        None => Vec::new(),
    };

    session
        .start()
        .await
        .with_context(|| format!("Failed to start relay to {}", config.pipeline.destination))?;

    let accepted = if options.block {
        write_blocking(&device, &session, &input, period, stall_periods).await?
    } else {
        session.write(&input)?
    };
    if accepted < input.len() {
        warn!(
            requested = input.len(),
            accepted,
            "Input did not fit in the data channel"
        );
    }

    let interrupted = tokio::select! {
        drained = wait_for_drain(&device, period, stall_periods) => {
            if !drained {
                warn!(
                    bytes_waiting = device.bytes_waiting(),
                    write_errors = device.stats().write_errors,
                    stall_periods,
                    "Sink made no progress, stopping relay"
                );
            }
            !drained
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping relay");
            true
        }
    };

    let drained = session.close().await.context("Failed to close relay device")?;
    let logs = device.read_all_logs(options.sort)?;
    let stats = device.stats();

    info!(
        accepted,
        drained,
        flushed = stats.bytes_flushed,
        events = stats.events,
        "Relay run finished"
    );

    Ok(RunReport {
        accepted,
        drained,
        interrupted,
        logs,
        stats,
    })
}

/// Counts consecutive checks in which no byte reached the sink.
struct Progress {
    flushed: u64,
    idle: u32,
    limit: u32,
}

impl Progress {
    fn new(device: &Device, limit: u32) -> Self {
        Self {
            flushed: device.stats().bytes_flushed,
            idle: 0,
            limit,
        }
    }

    /// True once `limit` checks in a row saw nothing flushed.
    fn stalled(&mut self, device: &Device) -> bool {
        let flushed = device.stats().bytes_flushed;
        if flushed == self.flushed {
            self.idle += 1;
        } else {
            self.flushed = flushed;
            self.idle = 0;
        }
        self.idle >= self.limit
    }
}

/// Keep writing until every byte is accepted, pausing one trigger period
/// whenever the channel is full. Gives up with a partial count if the sink
/// stops taking bytes.
async fn write_blocking(
    device: &Device,
    session: &DeviceSession,
    data: &[u8],
    period: Duration,
    stall_periods: u32,
) -> Result<usize> {
    let mut progress = Progress::new(device, stall_periods);
    let mut offset = 0;
    while offset < data.len() {
        let accepted = session.write(&data[offset..])?;
        offset += accepted;
        if accepted == 0 {
            tokio::time::sleep(period).await;
            if progress.stalled(device) {
                warn!(
                    accepted = offset,
                    remaining = data.len() - offset,
                    "Channel not draining, giving up on blocking write"
                );
                break;
            }
        }
    }
    Ok(offset)
}

/// Wait for an empty channel. Returns `false` if flushing stalled first.
async fn wait_for_drain(device: &Device, period: Duration, stall_periods: u32) -> bool {
    let mut progress = Progress::new(device, stall_periods);
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if device.bytes_waiting() == 0 {
            return true;
        }
        if progress.stalled(device) {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationConfig, DeviceConfig, PipelineConfig, TriggerConfig};
    use relay_core::LogKind;
    use relay_device::MemorySinkOpener;

    fn config(destination: String) -> RelayConfig {
        RelayConfig {
            application: ApplicationConfig::default(),
            device: DeviceConfig::default(),
            pipeline: PipelineConfig {
                irq_id: 0,
                destination,
                delay_ms: 1,
                chunk_size: 4,
                keep_missed: true,
                create_destination: true,
                append: false,
            },
            trigger: TriggerConfig {
                period_ms: 5,
                stall_periods: 40,
            },
        }
    }

    #[tokio::test]
    async fn test_run_relays_input_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        std::fs::write(&input, b"HELLOWORLD").unwrap();

        let config = config(output.to_str().unwrap().to_string());
        let options = RunOptions {
            input: Some(input),
            block: false,
            sort: LogSortKey::Count,
        };

        let report = run(&config, &options).await.unwrap();

        assert_eq!(report.accepted, 10);
        assert!(!report.interrupted);
        assert_eq!(std::fs::read(&output).unwrap(), b"HELLOWORLD");
        assert!(report.stats.events >= 3);
        assert!(report.logs.iter().any(|e| e.kind == LogKind::FlushExit));
    }

    #[tokio::test]
    async fn test_blocking_write_outlasts_small_channel() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        std::fs::write(&input, b"0123456789ABCDEF").unwrap();

        let mut config = config(output.to_str().unwrap().to_string());
        config.device.channel_capacity = 8;
        let options = RunOptions {
            input: Some(input),
            block: true,
            sort: LogSortKey::Type,
        };

        let report = run(&config, &options).await.unwrap();

        assert_eq!(report.accepted, 16);
        assert_eq!(std::fs::read(&output).unwrap(), b"0123456789ABCDEF");
    }

    #[tokio::test]
    async fn test_run_gives_up_on_stalled_sink() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        std::fs::write(&input, b"HELLOWORLD").unwrap();

        let mut config = config("/tmp/relay-out".to_string());
        config.device.channel_capacity = 4;
        config.trigger.stall_periods = 3;

        let memory = MemorySinkOpener::new();
        memory.fail_writes(true);
        let device = Device::new(
            "gih",
            config.device_options(),
            Arc::new(TimerEventSource::new(config.trigger_period())),
            Arc::new(memory.clone()),
        );
        let options = RunOptions {
            input: Some(input),
            block: true,
            sort: LogSortKey::Type,
        };

        let report = run_on(device, &config, &options).await.unwrap();

        // The blocking write and the drain wait both give up
        assert_eq!(report.accepted, 4);
        assert!(report.interrupted);
        assert_eq!(report.drained, 0);
        assert!(report.stats.write_errors > 0);
        assert_eq!(report.stats.bytes_flushed, 0);

        // keep_missed holds the bytes the sink refused
        assert_eq!(report.stats.bytes_waiting, 4);
        assert!(memory.contents().is_empty());
    }
}
