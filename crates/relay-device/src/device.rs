//! The relay device.
//!
//! A [`Device`] composes the data channel, the three log streams, the
//! configuration state machine, an [`EventSource`] and a [`SinkOpener`].
//! Clients interact with it through sessions:
//!
//! - [`Device::open`] returns the single [`DeviceSession`]: configure, write,
//!   start, stop, close
//! - [`Device::open_log`] returns the single [`LogSession`] for one stream
//!
//! Control operations (configuration, start, stop) are serialized by an async
//! control lock. Writes and log reads never take it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_device::{Device, DeviceOptions, MemorySinkOpener, SoftwareEventSource};
//!
//! # async fn example() -> relay_core::Result<()> {
//! let source = Arc::new(SoftwareEventSource::new());
//! let device = Device::new(
//!     "gih",
//!     DeviceOptions::default(),
//!     source.clone(),
//!     Arc::new(MemorySinkOpener::new()),
//! );
//!
//! let session = device.open()?;
//! session.set_event_source(3).await?;
//! session.set_path("/dev/null").await?;
//! session.write(b"HELLOWORLD")?;
//! session.start().await?;
//! source.fire(3);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use relay_core::{
    AnnotatedEntry, ConfigField, ConfigState, DataChannel, DeviceState, GateGuard, LogKind,
    LogSet, LogSortKey, OpenGate, RelayError, Result, RunParams, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_LOG_CAPACITY,
};

use crate::handler::EventDispatch;
use crate::sink::SinkOpener;
use crate::source::EventSource;
use crate::stats::{DeviceCounters, DeviceStats};
use crate::worker::{write_once, FlushWorker, SinkSlot};

/// Sizing and shutdown policy for a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Data channel capacity in bytes.
    pub channel_capacity: usize,
    /// Entries per log stream.
    pub log_capacity: usize,
    /// Flush jobs that may wait behind the running one.
    pub dispatch_queue: usize,
    /// Budget for `stop`: flush work, the final drain and the sink close.
    pub shutdown_timeout: Duration,
    /// Abandon queued and sleeping flushes on stop instead of finishing them.
    pub interrupt_flush_on_stop: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            dispatch_queue: 64,
            shutdown_timeout: Duration::from_secs(5),
            interrupt_flush_on_stop: true,
        }
    }
}

impl DeviceOptions {
    /// Size of the data channel in bytes.
    pub fn channel_capacity(mut self, bytes: usize) -> Self {
        self.channel_capacity = bytes;
        self
    }

    /// Entries held by each log stream.
    pub fn log_capacity(mut self, entries: usize) -> Self {
        self.log_capacity = entries;
        self
    }

    /// Flush jobs that may wait behind the running one.
    pub fn dispatch_queue(mut self, jobs: usize) -> Self {
        self.dispatch_queue = jobs;
        self
    }

    /// Budget for `stop`, covering the worker join, the drain and the sink close.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Cancel queued flushes on stop instead of running them.
    pub fn interrupt_flush_on_stop(mut self, interrupt: bool) -> Self {
        self.interrupt_flush_on_stop = interrupt;
        self
    }

    /// Reject sizes the device cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(RelayError::invalid("channel_capacity", "must be greater than 0"));
        }
        if self.log_capacity == 0 {
            return Err(RelayError::invalid("log_capacity", "must be greater than 0"));
        }
        if self.dispatch_queue == 0 {
            return Err(RelayError::invalid("dispatch_queue", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Resources held while running.
struct RunHandle {
    params: RunParams,
    sink: SinkSlot,
    stopping: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

struct DeviceInner {
    name: String,
    options: DeviceOptions,
    source: Arc<dyn EventSource>,
    opener: Arc<dyn SinkOpener>,
    channel: Arc<DataChannel>,
    logs: Arc<LogSet>,
    counters: Arc<DeviceCounters>,
    config: Mutex<ConfigState>,
    control: AsyncMutex<Option<RunHandle>>,
    gate: Arc<OpenGate>,
    log_gates: [Arc<OpenGate>; 3],
}

/// An event-triggered delayed-flush relay.
///
/// Cheap to clone; clones share the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Build a stopped, unconfigured device.
    ///
    /// Capacities of zero in `options` are raised to one; use
    /// [`DeviceOptions::validate`] to reject them instead.
    pub fn new(
        name: impl Into<String>,
        options: DeviceOptions,
        source: Arc<dyn EventSource>,
        opener: Arc<dyn SinkOpener>,
    ) -> Self {
        let name = name.into();
        let channel = Arc::new(DataChannel::new(options.channel_capacity.max(1)));
        let logs = Arc::new(LogSet::new(options.log_capacity.max(1)));

        debug!(
            device = %name,
            channel_capacity = channel.capacity(),
            log_capacity = options.log_capacity,
            "Device created"
        );

        Self {
            inner: Arc::new(DeviceInner {
                name,
                source,
                opener,
                channel,
                logs,
                counters: Arc::new(DeviceCounters::default()),
                config: Mutex::new(ConfigState::new()),
                control: AsyncMutex::new(None),
                gate: OpenGate::new("device"),
                log_gates: [
                    OpenGate::new(LogKind::Interrupt.name()),
                    OpenGate::new(LogKind::FlushEnter.name()),
                    OpenGate::new(LogKind::FlushExit.name()),
                ],
                options,
            }),
        }
    }

    /// Name used in diagnostics and error messages.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Options the device was built with.
    pub fn options(&self) -> &DeviceOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner.config.lock().state()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ConfigState {
        self.inner.config.lock().clone()
    }

    /// Bytes accepted but not yet flushed.
    pub fn bytes_waiting(&self) -> usize {
        self.inner.channel.bytes_waiting()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DeviceStats {
        DeviceStats::collect(
            self.state(),
            &self.inner.channel,
            &self.inner.logs,
            &self.inner.counters,
        )
    }

    /// Open the control session.
    ///
    /// A fresh session on a stopped device starts with an empty data
    /// channel.
    ///
    /// # Errors
    /// `Busy` if another session is open.
    pub fn open(&self) -> Result<DeviceSession> {
        let guard = self.inner.gate.try_acquire()?;
        if self.state().is_stopped() {
            let discarded = self.inner.channel.clear();
            if discarded > 0 {
                debug!(device = %self.inner.name, discarded, "Stale bytes discarded on open");
            }
        }
        info!(device = %self.inner.name, "Device opened");
        Ok(DeviceSession {
            device: self.clone(),
            guard: Some(guard),
        })
    }

    /// Open the reader session for one log stream.
    ///
    /// # Errors
    /// `Busy` if that stream already has a reader.
    pub fn open_log(&self, kind: LogKind) -> Result<LogSession> {
        let guard = self.log_gate(kind).try_acquire()?;
        Ok(LogSession {
            device: self.clone(),
            kind,
            guard,
        })
    }

    /// Drain all three log streams into one annotated, sorted view.
    ///
    /// # Errors
    /// `Busy` if any stream has a reader open.
    pub fn read_all_logs(&self, sort: LogSortKey) -> Result<Vec<AnnotatedEntry>> {
        let _guards = LogKind::ALL
            .iter()
            .map(|&kind| self.log_gate(kind).try_acquire())
            .collect::<Result<Vec<_>>>()?;
        Ok(self.inner.logs.read_all(sort))
    }

    /// Emergency recovery: revoke every open session.
    ///
    /// For clearing sessions left behind by a client that died without
    /// closing. Revoked sessions fail with `SessionRevoked`; the device's run
    /// state is untouched, so a new session can stop it.
    pub fn force_release(&self) {
        warn!(device = %self.inner.name, "Force-releasing all sessions");
        self.inner.gate.force_release();
        for gate in &self.inner.log_gates {
            gate.force_release();
        }
    }

    fn log_gate(&self, kind: LogKind) -> &Arc<OpenGate> {
        match kind {
            LogKind::Interrupt => &self.inner.log_gates[0],
            LogKind::FlushEnter => &self.inner.log_gates[1],
            LogKind::FlushExit => &self.inner.log_gates[2],
        }
    }

    async fn configure(&self, field: ConfigField) -> Result<()> {
        let _control = self.inner.control.lock().await;
        self.inner.config.lock().set(field)
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        let params = inner.config.lock().run_params()?;

        let (jobs_tx, jobs_rx) = mpsc::channel(inner.options.dispatch_queue.max(1));
        let handler = EventDispatch::new(
            Arc::clone(&inner.logs),
            Arc::clone(&inner.counters),
            jobs_tx,
        )
        .into_handler();

        inner.source.request(params.irq_id, handler)?;

        let sink = match inner.opener.open(&params.destination_path).await {
            Ok(sink) => sink,
            Err(source) => {
                inner.source.free(params.irq_id);
                warn!(
                    device = %inner.name,
                    path = %params.destination_path,
                    error = %source,
                    "Sink open failed, event line released"
                );
                return Err(RelayError::SinkUnavailable {
                    path: params.destination_path,
                    source,
                });
            }
        };
        let sink: SinkSlot = Arc::new(AsyncMutex::new(Some(sink)));

        let (stopping_tx, stopping_rx) = watch::channel(false);
        let worker = FlushWorker::new(
            &params,
            Arc::clone(&inner.channel),
            Arc::clone(&inner.logs),
            Arc::clone(&inner.counters),
            Arc::clone(&sink),
            inner.options.interrupt_flush_on_stop,
        );
        let worker = tokio::spawn(worker.run(jobs_rx, stopping_rx));

        inner.config.lock().mark_running();
        info!(
            device = %inner.name,
            irq_id = params.irq_id,
            delay_ms = params.delay.as_millis() as u64,
            chunk_size = params.chunk_size,
            path = %params.destination_path,
            keep_missed = params.keep_missed,
            "Device started"
        );

        *control = Some(RunHandle {
            params,
            sink,
            stopping: stopping_tx,
            worker,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        inner.config.lock().ensure_running()?;
        let Some(run) = control.take() else {
            return Err(RelayError::busy("device is not running"));
        };
        let RunHandle {
            params,
            sink,
            stopping,
            mut worker,
        } = run;

        // No new events past this point
        inner.source.free(params.irq_id);
        let _ = stopping.send(true);

        // One budget covers the join, the drain and the sink close
        let timeout = inner.options.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device = %inner.name, error = %e, "Flush worker ended abnormally"),
            Err(_) => {
                worker.abort();
                let _ = worker.await;
                // Abandoned without drain; the sink is dropped unclosed
                drop(sink.lock().await.take());
                if !params.keep_missed {
                    inner.channel.clear();
                }
                inner.config.lock().mark_stopped();
                error!(
                    device = %inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    bytes_waiting = inner.channel.bytes_waiting(),
                    "Flush work did not finish in time, worker aborted"
                );
                return Err(RelayError::ShutdownTimedOut(timeout));
            }
        }

        let mut slot = sink.lock().await;
        let finish = async {
            let drained = match slot.as_mut() {
                Some(sink) if params.keep_missed => {
                    let pending = inner.channel.bytes_waiting();
                    if pending == 0 {
                        0
                    } else {
                        let data = inner.channel.peek(pending);
                        let out = write_once(&mut **sink, &data, &inner.counters).await;
                        inner.channel.consume(out);
                        DeviceCounters::add(&inner.counters.bytes_flushed, out);
                        if out != pending {
                            warn!(
                                device = %inner.name,
                                pending,
                                written = out,
                                "Final drain incomplete, remainder stays queued"
                            );
                        }
                        out
                    }
                }
                _ => {
                    let discarded = inner.channel.clear();
                    if discarded > 0 {
                        debug!(device = %inner.name, discarded, "Missed bytes discarded on stop");
                    }
                    0
                }
            };

            if let Some(sink) = slot.take() {
                if let Err(e) = sink.close().await {
                    warn!(device = %inner.name, error = %e, "Sink close failed");
                }
            }
            drained
        };
        let finished = tokio::time::timeout_at(deadline, finish).await;

        let Ok(drained) = finished else {
            // Stuck in the drain write or the close; nothing unwritten was
            // consumed and the sink is dropped unclosed
            drop(slot.take());
            drop(slot);
            inner.config.lock().mark_stopped();
            error!(
                device = %inner.name,
                timeout_ms = timeout.as_millis() as u64,
                bytes_waiting = inner.channel.bytes_waiting(),
                "Sink did not finish the final drain in time"
            );
            return Err(RelayError::ShutdownTimedOut(timeout));
        };
        drop(slot);

        inner.config.lock().mark_stopped();
        info!(device = %inner.name, drained, "Device stopped");
        Ok(drained)
    }
}

/// The exclusive control session of a [`Device`].
///
/// Closing a running session stops it first, with the full drain. Dropping
/// one without [`close`](Self::close) spawns that stop on the current tokio
/// runtime.
#[derive(Debug)]
pub struct DeviceSession {
    device: Device,
    guard: Option<GateGuard>,
}

impl DeviceSession {
    fn check(&self) -> Result<()> {
        match &self.guard {
            Some(guard) => guard.check(),
            None => Err(RelayError::SessionRevoked("device")),
        }
    }

    /// The device this session controls.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Apply one configuration command.
    ///
    /// # Errors
    /// - `Busy` while running
    /// - `InvalidArgument` if the value is out of range
    pub async fn configure(&self, field: ConfigField) -> Result<()> {
        self.check()?;
        self.device.configure(field).await
    }

    /// Event line to trigger on.
    pub async fn set_event_source(&self, id: i32) -> Result<()> {
        self.configure(ConfigField::EventSource(id)).await
    }

    /// Delay between event and flush, in milliseconds.
    pub async fn set_delay(&self, ms: u32) -> Result<()> {
        self.configure(ConfigField::Delay(ms)).await
    }

    /// Bytes flushed per event.
    pub async fn set_chunk_size(&self, bytes: usize) -> Result<()> {
        self.configure(ConfigField::ChunkSize(bytes)).await
    }

    /// Destination handed to the sink opener at start.
    pub async fn set_path(&self, path: impl Into<String>) -> Result<()> {
        self.configure(ConfigField::Path(path.into())).await
    }

    /// Flush leftover bytes at stop instead of discarding them.
    pub async fn set_keep_missed(&self, keep: bool) -> Result<()> {
        self.configure(ConfigField::KeepMissed(keep)).await
    }

    /// Queue bytes for flushing. Legal in any state, never waits on a flush.
    ///
    /// Returns how many bytes fit; the rest are dropped and counted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.check()?;
        Ok(self.device.inner.channel.write(data))
    }

    /// Claim the event line, open the sink and begin flushing.
    ///
    /// # Errors
    /// - `Busy` if already running
    /// - `InvalidArgument` if the event line or path is unset
    /// - `SourceUnavailable` if the line cannot be claimed
    /// - `SinkUnavailable` if the destination cannot be opened; the line is
    ///   released again
    pub async fn start(&self) -> Result<()> {
        self.check()?;
        self.device.start().await
    }

    /// Release the event line, settle outstanding flushes, drain and close
    /// the sink. Returns the bytes written by the drain.
    ///
    /// # Errors
    /// - `Busy` if not running
    /// - `ShutdownTimedOut` if flush work, the drain or the sink close
    ///   outlived the shutdown budget; the device is stopped regardless, the
    ///   sink is dropped unclosed and unwritten bytes are not consumed
    pub async fn stop(&self) -> Result<usize> {
        self.check()?;
        self.device.stop().await
    }

    /// End the session, stopping the device first if it is running.
    ///
    /// Returns the bytes written by that stop's drain, or 0.
    pub async fn close(mut self) -> Result<usize> {
        let guard = self.guard.take();
        let current = guard.as_ref().is_some_and(GateGuard::is_current);
        if !current {
            return Err(RelayError::SessionRevoked("device"));
        }

        let drained = if self.device.state() == DeviceState::Running {
            self.device.stop().await
        } else {
            Ok(0)
        };
        drop(guard);
        info!(device = %self.device.inner.name, "Device closed");
        drained
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        if !guard.is_current() || self.device.state() != DeviceState::Running {
            return;
        }

        warn!(device = %self.device.inner.name, "Session dropped while running, stopping");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let device = self.device.clone();
                runtime.spawn(async move {
                    if let Err(e) = device.stop().await {
                        warn!(device = %device.inner.name, error = %e, "Stop after drop failed");
                    }
                    drop(guard);
                });
            }
            Err(_) => {
                error!(device = %self.device.inner.name, "No runtime to stop device on drop");
            }
        }
    }
}

/// The exclusive reader session of one log stream.
#[derive(Debug)]
pub struct LogSession {
    device: Device,
    kind: LogKind,
    guard: GateGuard,
}

impl LogSession {
    /// Stream this session reads.
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Drain whole entries rendered as text, up to `max_len` bytes.
    ///
    /// An empty string means nothing is queued, or the oldest entry alone
    /// does not fit.
    pub fn read(&self, max_len: usize) -> Result<String> {
        self.guard.check()?;
        Ok(self.device.inner.logs.get(self.kind).drain_as_text(max_len))
    }

    /// Entries currently queued.
    pub fn pending(&self) -> Result<usize> {
        self.guard.check()?;
        Ok(self.device.inner.logs.get(self.kind).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySinkOpener;
    use crate::source::SoftwareEventSource;
    use relay_core::ErrorKind;

    fn device() -> (Device, Arc<SoftwareEventSource>, MemorySinkOpener) {
        let source = Arc::new(SoftwareEventSource::new());
        let memory = MemorySinkOpener::new();
        let device = Device::new(
            "test",
            DeviceOptions::default(),
            source.clone(),
            Arc::new(memory.clone()),
        );
        (device, source, memory)
    }

    #[test]
    fn test_options_builder_and_validate() {
        let options = DeviceOptions::default()
            .channel_capacity(64)
            .log_capacity(4)
            .dispatch_queue(2)
            .shutdown_timeout(Duration::from_millis(10))
            .interrupt_flush_on_stop(false);
        assert!(options.validate().is_ok());
        assert_eq!(options.channel_capacity, 64);
        assert!(!options.interrupt_flush_on_stop);

        let err = DeviceOptions::default().dispatch_queue(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_open_is_exclusive() {
        let (device, _, _) = device();
        let session = device.open().unwrap();
        assert!(device.open().unwrap_err().is_busy());
        session.close().await.unwrap();
        assert!(device.open().is_ok());
    }

    #[tokio::test]
    async fn test_open_resets_channel() {
        let (device, _, _) = device();
        let session = device.open().unwrap();
        session.write(b"leftover").unwrap();
        session.close().await.unwrap();
        assert_eq!(device.bytes_waiting(), 8);

        let _session = device.open().unwrap();
        assert_eq!(device.bytes_waiting(), 0);
    }

    #[tokio::test]
    async fn test_start_rolls_back_on_sink_failure() {
        let (device, source, memory) = device();
        memory.fail_open(true);

        let session = device.open().unwrap();
        session.set_event_source(2).await.unwrap();
        session.set_path("/nowhere").await.unwrap();

        let err = session.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SinkUnavailable);
        assert!(!source.is_claimed(2));
        assert_eq!(device.state(), DeviceState::Configured);
    }

    #[tokio::test]
    async fn test_log_session_exclusive() {
        let (device, _, _) = device();
        let reader = device.open_log(LogKind::FlushExit).unwrap();
        assert!(device.open_log(LogKind::FlushExit).unwrap_err().is_busy());
        assert!(device.open_log(LogKind::Interrupt).is_ok());

        // The merged view needs every stream
        assert!(device.read_all_logs(LogSortKey::Type).unwrap_err().is_busy());
        drop(reader);
        assert!(device.read_all_logs(LogSortKey::Type).unwrap().is_empty());
    }
}
