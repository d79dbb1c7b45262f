//! Deferred half of the pipeline.
//!
//! One [`FlushWorker`] task runs per started device. It takes [`FlushJob`]s
//! off the dispatch queue strictly in order, so flushes never overlap, and
//! performs each one under the flush lock:
//!
//! 1. record `enter_log`
//! 2. lock the sink
//! 3. `n = min(bytes_waiting, chunk_size)`
//! 4. sleep the configured delay, less the scheduling correction
//! 5. write the first `n` queued bytes and sync
//! 6. consume only what the sink took
//! 7. unlock
//! 8. record `exit_log` with the byte count
//!
//! When the device stops, the worker either finishes the queued jobs or
//! abandons them before they touch the channel, depending on
//! [`DeviceOptions::interrupt_flush_on_stop`](crate::DeviceOptions).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use relay_core::{DataChannel, LogSet, RunParams};

use crate::handler::FlushJob;
use crate::sink::Sink;
use crate::stats::DeviceCounters;

/// The sink slot guarded by the flush lock. `None` once the device has
/// stopped.
pub(crate) type SinkSlot = Arc<AsyncMutex<Option<Box<dyn Sink>>>>;

pub(crate) struct FlushWorker {
    channel: Arc<DataChannel>,
    logs: Arc<LogSet>,
    counters: Arc<DeviceCounters>,
    sink: SinkSlot,
    chunk_size: usize,
    delay: Duration,
    interrupt_on_stop: bool,
}

enum Outcome {
    Written(usize),
    Cancelled,
}

impl FlushWorker {
    pub fn new(
        params: &RunParams,
        channel: Arc<DataChannel>,
        logs: Arc<LogSet>,
        counters: Arc<DeviceCounters>,
        sink: SinkSlot,
        interrupt_on_stop: bool,
    ) -> Self {
        Self {
            channel,
            logs,
            counters,
            sink,
            chunk_size: params.chunk_size,
            delay: params.corrected_delay(),
            interrupt_on_stop,
        }
    }

    /// Process jobs until told to stop, then settle whatever is still queued.
    pub async fn run(
        self,
        mut jobs: mpsc::Receiver<FlushJob>,
        mut stopping: watch::Receiver<bool>,
    ) {
        debug!(chunk_size = self.chunk_size, delay = ?self.delay, "Flush worker started");

        loop {
            if *stopping.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = stopping.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => self.flush(job, &mut stopping).await,
                    None => break,
                },
            }
        }

        // The event line is already freed; settle what was queued before that
        jobs.close();
        while let Some(job) = jobs.recv().await {
            if self.interrupt_on_stop {
                DeviceCounters::bump(&self.counters.cancelled_flushes);
                trace!(trigger = job.trigger, "Queued flush cancelled by stop");
            } else {
                self.flush(job, &mut stopping).await;
            }
        }

        debug!("Flush worker finished");
    }

    async fn flush(&self, job: FlushJob, stopping: &mut watch::Receiver<bool>) {
        self.logs.flush_enter.record(None);

        let outcome = {
            let mut slot = self.sink.lock().await;
            match slot.as_mut() {
                Some(sink) => self.flush_locked(&mut **sink, stopping).await,
                None => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Written(out) => {
                DeviceCounters::bump(&self.counters.flushes_completed);
                DeviceCounters::add(&self.counters.bytes_flushed, out);
                self.logs.flush_exit.record(Some(out as i64));
                trace!(trigger = job.trigger, bytes = out, "Flush completed");
            }
            Outcome::Cancelled => {
                DeviceCounters::bump(&self.counters.cancelled_flushes);
                debug!(trigger = job.trigger, "In-flight flush cancelled by stop");
            }
        }
    }

    async fn flush_locked(
        &self,
        sink: &mut dyn Sink,
        stopping: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let n = self.channel.bytes_waiting().min(self.chunk_size);

        if self.pause(stopping).await {
            return Outcome::Cancelled;
        }

        if n == 0 {
            return Outcome::Written(0);
        }

        let data = self.channel.peek(n);
        let out = write_once(sink, &data, &self.counters).await;
        self.channel.consume(out);

        if out != n {
            warn!(
                requested = n,
                written = out,
                remaining = self.channel.bytes_waiting(),
                "Short flush, remainder stays queued"
            );
        }
        Outcome::Written(out)
    }

    /// Sleep out the delay. Returns true if a stop cut it short.
    async fn pause(&self, stopping: &mut watch::Receiver<bool>) -> bool {
        if !self.interrupt_on_stop {
            tokio::time::sleep(self.delay).await;
            return false;
        }
        if *stopping.borrow() {
            return true;
        }
        if self.delay.is_zero() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = stopping.changed() => true,
        }
    }
}

/// One write plus sync. Returns the bytes the sink accepted; failures are
/// logged and counted, never raised.
pub(crate) async fn write_once(
    sink: &mut dyn Sink,
    data: &[u8],
    counters: &DeviceCounters,
) -> usize {
    let out = match sink.write(data).await {
        Ok(out) => out.min(data.len()),
        Err(e) => {
            DeviceCounters::bump(&counters.write_errors);
            warn!(error = %e, requested = data.len(), "Sink write failed");
            return 0;
        }
    };
    if out != data.len() {
        DeviceCounters::bump(&counters.write_errors);
    }

    if let Err(e) = sink.sync().await {
        DeviceCounters::bump(&counters.write_errors);
        warn!(error = %e, "Sink sync failed");
    }
    out
}
