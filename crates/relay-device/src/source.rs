//! Trigger event sources.
//!
//! An [`EventSource`] owns a set of numbered lines. The device claims one line
//! at `start` by registering an [`EventHandler`], and frees it at `stop`. The
//! handler runs in the source's own context and must never block.
//!
//! - [`SoftwareEventSource`]: events are raised by calling
//!   [`fire`](SoftwareEventSource::fire), as tests and embedders do
//! - [`TimerEventSource`]: each claimed line fires on a fixed tokio interval

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use relay_core::{RelayError, Result};

/// Callback invoked once per event.
pub type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// Something that raises numbered events.
pub trait EventSource: Send + Sync {
    /// Claim `line` and route its events to `handler`.
    ///
    /// # Errors
    /// `SourceUnavailable` if the line does not exist or is already claimed.
    fn request(&self, line: u32, handler: EventHandler) -> Result<()>;

    /// Release `line`. No new invocation of the handler starts after this
    /// returns; one already in progress on another thread may still finish.
    /// Freeing an unclaimed line is a no-op.
    fn free(&self, line: u32);
}

fn unavailable(line: u32, reason: impl Into<String>) -> RelayError {
    RelayError::SourceUnavailable {
        line,
        reason: reason.into(),
    }
}

// =============================================================================
// Software source
// =============================================================================

/// Manually fired event lines.
pub struct SoftwareEventSource {
    lines: Range<u32>,
    handlers: Mutex<HashMap<u32, EventHandler>>,
}

impl SoftwareEventSource {
    /// Source exposing lines `0..16`.
    pub fn new() -> Self {
        Self::with_lines(0..16)
    }

    /// Source exposing exactly `lines`.
    pub fn with_lines(lines: Range<u32>) -> Self {
        Self {
            lines,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Raise one event on `line`.
    ///
    /// Returns `false` if nothing is listening. The handler runs on the
    /// caller's thread after the registry lock is released.
    pub fn fire(&self, line: u32) -> bool {
        let handler = self.handlers.lock().get(&line).cloned();
        match handler {
            Some(handler) => {
                trace!(line, "Firing software event");
                handler();
                true
            }
            None => false,
        }
    }

    /// True while `line` is claimed.
    pub fn is_claimed(&self, line: u32) -> bool {
        self.handlers.lock().contains_key(&line)
    }
}

impl Default for SoftwareEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for SoftwareEventSource {
    fn request(&self, line: u32, handler: EventHandler) -> Result<()> {
        if !self.lines.contains(&line) {
            return Err(unavailable(
                line,
                format!("no such line (valid {:?})", self.lines),
            ));
        }
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&line) {
            return Err(unavailable(line, "already claimed"));
        }
        handlers.insert(line, handler);
        debug!(line, "Software event line claimed");
        Ok(())
    }

    fn free(&self, line: u32) {
        if self.handlers.lock().remove(&line).is_some() {
            debug!(line, "Software event line freed");
        }
    }
}

// =============================================================================
// Timer source
// =============================================================================

/// Event lines driven by a periodic tokio interval.
///
/// Must be used from within a tokio runtime; `request` fails otherwise.
pub struct TimerEventSource {
    period: Duration,
    tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl TimerEventSource {
    /// Fire every `period` on each claimed line. The first event comes one
    /// period after the claim.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Interval between events on each claimed line.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl EventSource for TimerEventSource {
    fn request(&self, line: u32, handler: EventHandler) -> Result<()> {
        if self.period.is_zero() {
            return Err(unavailable(line, "timer period must be non-zero"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| unavailable(line, format!("no tokio runtime: {}", e)))?;

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&line) {
            return Err(unavailable(line, "already claimed"));
        }

        let period = self.period;
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handler();
            }
        });
        tasks.insert(line, task);

        info!(line, period_ms = period.as_millis() as u64, "Timer event line claimed");
        Ok(())
    }

    fn free(&self, line: u32) {
        if let Some(task) = self.tasks.lock().remove(&line) {
            task.abort();
            debug!(line, "Timer event line freed");
        }
    }
}

impl Drop for TimerEventSource {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler() -> (EventHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler: EventHandler = {
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (handler, count)
    }

    #[test]
    fn test_software_fire_reaches_handler() {
        let source = SoftwareEventSource::new();
        let (handler, count) = counting_handler();

        assert!(!source.fire(3));
        source.request(3, handler).unwrap();
        assert!(source.fire(3));
        assert!(source.fire(3));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        source.free(3);
        assert!(!source.fire(3));
        assert!(!source.is_claimed(3));
    }

    #[test]
    fn test_free_lets_running_handler_finish() {
        use std::sync::Barrier;

        let source = Arc::new(SoftwareEventSource::new());
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (counted, count) = counting_handler();

        let handler: EventHandler = {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            Arc::new(move || {
                entered.wait();
                release.wait();
                counted();
            })
        };
        source.request(2, handler).unwrap();

        let firing = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.fire(2))
        };

        // Free while the handler is mid-call
        entered.wait();
        source.free(2);
        assert!(!source.is_claimed(2));

        release.wait();
        assert!(firing.join().unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Nothing new starts after free
        assert!(!source.fire(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_software_rejects_bad_and_claimed_lines() {
        let source = SoftwareEventSource::with_lines(0..2);
        let (handler, _) = counting_handler();

        let err = source.request(5, Arc::clone(&handler)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);

        source.request(1, Arc::clone(&handler)).unwrap();
        let err = source.request(1, handler).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_periodically_until_freed() {
        let source = TimerEventSource::new(Duration::from_millis(10));
        let (handler, count) = counting_handler();
        source.request(0, handler).unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        source.free(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timer_requires_runtime() {
        let source = TimerEventSource::new(Duration::from_millis(10));
        let (handler, _) = counting_handler();
        let err = source.request(0, handler).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    }
}
