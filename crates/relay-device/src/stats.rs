//! Loss and throughput counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_core::{DataChannel, DeviceState, LogSet};

/// Counters shared by the event path, the flush worker and the device.
#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    pub events: AtomicU64,
    pub missed_dispatches: AtomicU64,
    pub flushes_completed: AtomicU64,
    pub cancelled_flushes: AtomicU64,
    pub bytes_flushed: AtomicU64,
    pub write_errors: AtomicU64,
}

impl DeviceCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Entries dropped per log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogDrops {
    /// `intr_log`
    pub interrupt: u64,
    /// `enter_log`
    pub flush_enter: u64,
    /// `exit_log`
    pub flush_exit: u64,
}

/// Point-in-time snapshot of a device's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    /// Lifecycle state at snapshot time.
    pub state: DeviceState,
    /// Bytes queued for flushing.
    pub bytes_waiting: usize,
    /// Bytes refused by `write` because the channel was full.
    pub bytes_dropped: u64,
    /// Events raised on the claimed line.
    pub events: u64,
    /// Events whose flush could not be queued.
    pub missed_dispatches: u64,
    /// Flush cycles that reached the exit log.
    pub flushes_completed: u64,
    /// Flushes abandoned by `stop` before they touched the channel.
    pub cancelled_flushes: u64,
    /// Bytes written to the sink, drains included.
    pub bytes_flushed: u64,
    /// Failed or short sink writes and failed syncs.
    pub write_errors: u64,
    /// Entries lost to full log streams.
    pub log_entries_dropped: LogDrops,
}

impl DeviceStats {
    pub(crate) fn collect(
        state: DeviceState,
        channel: &DataChannel,
        logs: &LogSet,
        counters: &DeviceCounters,
    ) -> Self {
        Self {
            state,
            bytes_waiting: channel.bytes_waiting(),
            bytes_dropped: channel.bytes_dropped(),
            events: counters.events.load(Ordering::Relaxed),
            missed_dispatches: counters.missed_dispatches.load(Ordering::Relaxed),
            flushes_completed: counters.flushes_completed.load(Ordering::Relaxed),
            cancelled_flushes: counters.cancelled_flushes.load(Ordering::Relaxed),
            bytes_flushed: counters.bytes_flushed.load(Ordering::Relaxed),
            write_errors: counters.write_errors.load(Ordering::Relaxed),
            log_entries_dropped: LogDrops {
                interrupt: logs.interrupt.dropped(),
                flush_enter: logs.flush_enter.dropped(),
                flush_exit: logs.flush_exit.dropped(),
            },
        }
    }
}
