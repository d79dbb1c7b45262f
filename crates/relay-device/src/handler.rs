//! Event-path half of the pipeline.
//!
//! [`EventDispatch::on_event`] runs inside the event source's context, so it
//! only touches atomics, the lock-free interrupt log and `try_send`. A full
//! log or a full dispatch queue drops the record or job and counts it.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use relay_core::LogSet;

use crate::source::EventHandler;
use crate::stats::DeviceCounters;

/// One deferred flush, tagged with the interrupt sequence that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushJob {
    pub trigger: u64,
}

pub(crate) struct EventDispatch {
    logs: Arc<LogSet>,
    counters: Arc<DeviceCounters>,
    jobs: mpsc::Sender<FlushJob>,
}

impl EventDispatch {
    pub fn new(
        logs: Arc<LogSet>,
        counters: Arc<DeviceCounters>,
        jobs: mpsc::Sender<FlushJob>,
    ) -> Self {
        Self {
            logs,
            counters,
            jobs,
        }
    }

    /// Record the event and queue one flush for it.
    pub fn on_event(&self) {
        let trigger = self.logs.interrupt.next_sequence();
        self.logs.interrupt.try_record_with(trigger, None);
        DeviceCounters::bump(&self.counters.events);

        match self.jobs.try_send(FlushJob { trigger }) {
            Ok(()) => trace!(trigger, "Flush dispatched"),
            Err(TrySendError::Full(_)) => {
                DeviceCounters::bump(&self.counters.missed_dispatches);
                debug!(trigger, "Flush queue full, dispatch missed");
            }
            Err(TrySendError::Closed(_)) => {
                DeviceCounters::bump(&self.counters.missed_dispatches);
                trace!(trigger, "Flush worker gone, dispatch missed");
            }
        }
    }

    /// Wrap into the callback shape event sources expect.
    pub fn into_handler(self) -> EventHandler {
        Arc::new(move || self.on_event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_event_records_and_dispatches() {
        let logs = Arc::new(LogSet::new(8));
        let counters = Arc::new(DeviceCounters::default());
        let (tx, mut rx) = mpsc::channel(4);

        let dispatch = EventDispatch::new(Arc::clone(&logs), Arc::clone(&counters), tx);
        dispatch.on_event();
        dispatch.on_event();

        assert_eq!(rx.try_recv().unwrap(), FlushJob { trigger: 0 });
        assert_eq!(rx.try_recv().unwrap(), FlushJob { trigger: 1 });
        assert_eq!(logs.interrupt.len(), 2);
        assert_eq!(counters.events.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_full_queue_counts_missed_dispatch() {
        let logs = Arc::new(LogSet::new(8));
        let counters = Arc::new(DeviceCounters::default());
        let (tx, _rx) = mpsc::channel(1);

        let handler = EventDispatch::new(Arc::clone(&logs), Arc::clone(&counters), tx).into_handler();
        handler();
        handler();
        handler();

        // Every event is still logged
        assert_eq!(logs.interrupt.len(), 3);
        assert_eq!(counters.missed_dispatches.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_closed_queue_counts_missed_dispatch() {
        let logs = Arc::new(LogSet::new(8));
        let counters = Arc::new(DeviceCounters::default());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        EventDispatch::new(logs, Arc::clone(&counters), tx).on_event();
        assert_eq!(counters.missed_dispatches.load(Ordering::Relaxed), 1);
    }
}
