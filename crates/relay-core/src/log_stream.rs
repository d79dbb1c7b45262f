//! Timestamped flush logs.
//!
//! A device keeps three independent [`LogStream`]s:
//!
//! | Stream | Recorded when | `bytes_sent` |
//! |---|---|---|
//! | [`LogKind::Interrupt`] | the trigger event fires | absent |
//! | [`LogKind::FlushEnter`] | a flush cycle begins | absent |
//! | [`LogKind::FlushExit`] | a flush cycle completes | bytes written |
//!
//! Each stream assigns its own monotonically increasing sequence number and
//! never resets it, so gaps in a drained stream reveal dropped entries.
//! Recording is best-effort: a full stream drops the newest entry and counts
//! it, the producer never sees an error.
//!
//! Reading is destructive. [`LogStream::drain_as_text`] pops entries and
//! renders one line per entry:
//!
//! ```text
//! [1700000000.123456] interrupt count: 0 | write size: -1
//! ```

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Default number of entries per log stream.
pub const DEFAULT_LOG_CAPACITY: usize = 8192;

/// Marker rendered in place of an absent byte count.
pub const ABSENT_BYTES_MARKER: i64 = -1;

/// Which of the three streams an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Trigger event fired.
    Interrupt,
    /// Flush cycle entered.
    FlushEnter,
    /// Flush cycle exited.
    FlushExit,
}

impl LogKind {
    /// All streams in display order.
    pub const ALL: [LogKind; 3] = [LogKind::Interrupt, LogKind::FlushEnter, LogKind::FlushExit];

    /// Short stream name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            LogKind::Interrupt => "intr_log",
            LogKind::FlushEnter => "enter_log",
            LogKind::FlushExit => "exit_log",
        }
    }

    /// Suffix appended to each line in the merged view.
    pub fn annotation(self) -> &'static str {
        match self {
            LogKind::Interrupt => "at interrupt happening",
            LogKind::FlushEnter => "at entering workqueue",
            LogKind::FlushExit => "at exiting workqueue",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Per-stream sequence number.
    pub sequence: u64,
    /// Wall-clock time of recording.
    pub timestamp: DateTime<Utc>,
    /// Bytes written, for flush exit entries only.
    pub bytes_sent: Option<i64>,
}

impl LogEntry {
    /// Render the entry as one newline-terminated line.
    pub fn to_line(&self) -> String {
        format!(
            "[{:010}.{:06}] interrupt count: {} | write size: {}\n",
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_micros(),
            self.sequence,
            self.bytes_sent.unwrap_or(ABSENT_BYTES_MARKER)
        )
    }
}

/// Bounded, destructively-read queue of [`LogEntry`]s.
///
/// Producers never take a lock: a slot is reserved against `capacity` with
/// one atomic update and the entry goes into a lock-free [`ArrayQueue`], so
/// the only reason to drop an entry is a full stream. Readers serialize on a
/// separate mutex that also holds back the head entry when it does not fit a
/// read limit.
#[derive(Debug)]
pub struct LogStream {
    kind: LogKind,
    capacity: usize,
    entries: ArrayQueue<LogEntry>,
    /// Recorded but not yet delivered, the held-back head included.
    queued: AtomicUsize,
    held: Mutex<Option<LogEntry>>,
    next_sequence: AtomicU64,
    dropped: AtomicU64,
}

impl LogStream {
    /// Create an empty stream holding at most `capacity` entries.
    pub fn new(kind: LogKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            entries: ArrayQueue::new(capacity.max(1)),
            queued: AtomicUsize::new(0),
            held: Mutex::new(None),
            next_sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Stream identity.
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    /// Claim the next sequence number.
    ///
    /// Lock-free; safe from the event path.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Record an entry under the next sequence number.
    ///
    /// Returns the sequence number assigned.
    pub fn record(&self, bytes_sent: Option<i64>) -> u64 {
        let sequence = self.next_sequence();
        self.push(sequence, bytes_sent);
        sequence
    }

    /// Record an entry with a pre-assigned sequence.
    ///
    /// Never blocks. The entry is dropped and counted only when the stream
    /// is full; concurrent readers do not cause loss.
    pub fn try_record_with(&self, sequence: u64, bytes_sent: Option<i64>) {
        self.push(sequence, bytes_sent);
    }

    fn push(&self, sequence: u64, bytes_sent: Option<i64>) {
        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let entry = LogEntry {
            sequence,
            timestamp: Utc::now(),
            bytes_sent,
        };
        // The reservation bounds the queue length, so this only fails if that
        // accounting is broken
        if self.entries.push(entry).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take_next(&self, held: &mut Option<LogEntry>) -> Option<LogEntry> {
        held.take().or_else(|| self.entries.pop())
    }

    fn delivered(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// True when no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries lost to a full stream.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pop every entry that was queued when the call started.
    ///
    /// Entries recorded while draining are left for the next call.
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut held = self.held.lock();
        let snapshot = self.len();
        let mut out = Vec::with_capacity(snapshot);
        while out.len() < snapshot {
            let Some(entry) = self.take_next(&mut held) else {
                break;
            };
            self.delivered();
            out.push(entry);
        }
        out
    }

    /// Pop and render entries until the output would exceed `limit` bytes.
    ///
    /// Only whole lines are emitted. An entry that does not fit stays queued
    /// for the next read.
    pub fn drain_as_text(&self, limit: usize) -> String {
        let mut held = self.held.lock();
        let snapshot = self.len();
        let mut out = String::new();
        let mut rendered = 0;

        while rendered < snapshot {
            let Some(entry) = self.take_next(&mut held) else {
                break;
            };
            let line = entry.to_line();
            if out.len() + line.len() > limit {
                *held = Some(entry);
                break;
            }
            self.delivered();
            out.push_str(&line);
            rendered += 1;
        }

        trace!(
            stream = self.kind.name(),
            rendered,
            remaining = snapshot.saturating_sub(rendered),
            "Drained log stream"
        );
        out
    }
}

/// Sort order for [`LogSet::read_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSortKey {
    /// Grouped by stream (interrupt, enter, exit), each in sequence order.
    #[default]
    Type,
    /// Ordered by timestamp; ties keep stream order.
    Time,
    /// Ordered by per-stream sequence number; ties keep stream order.
    Count,
}

impl std::str::FromStr for LogSortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "type" => Ok(Self::Type),
            "time" => Ok(Self::Time),
            "count" => Ok(Self::Count),
            other => Err(format!(
                "Invalid sort key '{}'. Must be one of: type, time, count",
                other
            )),
        }
    }
}

/// One entry of the merged view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedEntry {
    /// Stream the entry was drained from.
    pub kind: LogKind,
    /// The entry itself.
    pub entry: LogEntry,
}

impl fmt::Display for AnnotatedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self.entry.to_line();
        write!(f, "{} {}", line.trim_end(), self.kind.annotation())
    }
}

/// The three streams of a device.
#[derive(Debug)]
pub struct LogSet {
    /// `intr_log`
    pub interrupt: LogStream,
    /// `enter_log`
    pub flush_enter: LogStream,
    /// `exit_log`
    pub flush_exit: LogStream,
}

impl LogSet {
    /// Create three empty streams of the same capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            interrupt: LogStream::new(LogKind::Interrupt, capacity),
            flush_enter: LogStream::new(LogKind::FlushEnter, capacity),
            flush_exit: LogStream::new(LogKind::FlushExit, capacity),
        }
    }

    /// Look up a stream by kind.
    pub fn get(&self, kind: LogKind) -> &LogStream {
        match kind {
            LogKind::Interrupt => &self.interrupt,
            LogKind::FlushEnter => &self.flush_enter,
            LogKind::FlushExit => &self.flush_exit,
        }
    }

    /// Drain all three streams into one annotated, sorted list.
    pub fn read_all(&self, sort: LogSortKey) -> Vec<AnnotatedEntry> {
        let mut all: Vec<AnnotatedEntry> = LogKind::ALL
            .iter()
            .flat_map(|&kind| {
                self.get(kind)
                    .drain()
                    .into_iter()
                    .map(move |entry| AnnotatedEntry { kind, entry })
            })
            .collect();

        // Stable sorts keep stream order for equal keys
        match sort {
            LogSortKey::Type => {}
            LogSortKey::Time => all.sort_by_key(|e| e.entry.timestamp),
            LogSortKey::Count => all.sort_by_key(|e| e.entry.sequence),
        }
        all
    }

    /// Render [`read_all`](Self::read_all) as newline-separated text.
    pub fn read_all_text(&self, sort: LogSortKey) -> String {
        let mut out = String::new();
        for entry in self.read_all(sort) {
            let _ = writeln!(out, "{}", entry);
        }
        out
    }
}

impl Default for LogSet {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_line_format() {
        let entry = LogEntry {
            sequence: 3,
            timestamp: Utc.timestamp_opt(1_700_000_000, 42_000).unwrap(),
            bytes_sent: None,
        };
        assert_eq!(
            entry.to_line(),
            "[1700000000.000042] interrupt count: 3 | write size: -1\n"
        );

        let entry = LogEntry {
            bytes_sent: Some(5),
            ..entry
        };
        assert!(entry.to_line().ends_with("write size: 5\n"));
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let stream = LogStream::new(LogKind::Interrupt, 8);
        assert_eq!(stream.record(None), 0);
        assert_eq!(stream.record(None), 1);
        assert_eq!(stream.record(None), 2);

        let seqs: Vec<u64> = stream.drain().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        // Draining never resets the counter
        assert_eq!(stream.record(None), 3);
    }

    #[test]
    fn test_overflow_drops_newest() {
        let stream = LogStream::new(LogKind::FlushExit, 2);
        stream.record(Some(1));
        stream.record(Some(2));
        stream.record(Some(3));

        assert_eq!(stream.len(), 2);
        assert_eq!(stream.dropped(), 1);

        let entries = stream.drain();
        assert_eq!(entries[0].bytes_sent, Some(1));
        assert_eq!(entries[1].bytes_sent, Some(2));
    }

    #[test]
    fn test_try_record_uses_given_sequence() {
        let stream = LogStream::new(LogKind::Interrupt, 4);
        let seq = stream.next_sequence();
        stream.try_record_with(seq, None);
        let entries = stream.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, seq);
    }

    #[test]
    fn test_concurrent_reader_loses_no_entries() {
        use std::sync::atomic::AtomicBool;

        const EVENTS: usize = 20_000;
        let stream = LogStream::new(LogKind::Interrupt, EVENTS * 2);
        let done = AtomicBool::new(false);

        let read = std::thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut lines = 0;
                while !done.load(Ordering::Acquire) {
                    lines += stream.drain_as_text(usize::MAX).lines().count();
                }
                lines
            });

            for _ in 0..EVENTS {
                let seq = stream.next_sequence();
                stream.try_record_with(seq, None);
            }
            done.store(true, Ordering::Release);
            reader.join().unwrap()
        });

        let rest = stream.drain();
        assert_eq!(stream.dropped(), 0);
        assert_eq!(read + rest.len(), EVENTS);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_full_stream_refuses_until_read() {
        let stream = LogStream::new(LogKind::Interrupt, 2);
        for _ in 0..3 {
            let seq = stream.next_sequence();
            stream.try_record_with(seq, None);
        }
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.dropped(), 1);

        // A held-back head still occupies its slot
        assert!(stream.drain_as_text(1).is_empty());
        stream.try_record_with(stream.next_sequence(), None);
        assert_eq!(stream.dropped(), 2);

        let seqs: Vec<u64> = stream.drain().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);

        stream.try_record_with(stream.next_sequence(), None);
        assert_eq!(stream.drain()[0].sequence, 4);
    }

    #[test]
    fn test_drain_as_text_stops_at_whole_entry() {
        let stream = LogStream::new(LogKind::Interrupt, 8);
        for _ in 0..3 {
            stream.record(None);
        }

        let one_line = LogEntry {
            sequence: 0,
            timestamp: Utc::now(),
            bytes_sent: None,
        }
        .to_line()
        .len();

        // Room for one and a half lines
        let text = stream.drain_as_text(one_line + one_line / 2);
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("interrupt count: 0"));

        // The rest is still queued
        assert_eq!(stream.len(), 2);
        let text = stream.drain_as_text(usize::MAX);
        assert!(text.contains("interrupt count: 1"));
        assert!(text.contains("interrupt count: 2"));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_read_all_sorted_by_count() {
        let logs = LogSet::new(8);
        logs.interrupt.record(None);
        logs.interrupt.record(None);
        logs.flush_enter.record(None);
        logs.flush_exit.record(Some(5));

        let merged = logs.read_all(LogSortKey::Count);
        let order: Vec<(LogKind, u64)> = merged
            .iter()
            .map(|e| (e.kind, e.entry.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (LogKind::Interrupt, 0),
                (LogKind::FlushEnter, 0),
                (LogKind::FlushExit, 0),
                (LogKind::Interrupt, 1),
            ]
        );
        assert!(logs.interrupt.is_empty());
    }

    #[test]
    fn test_read_all_text_annotates_lines() {
        let logs = LogSet::new(8);
        logs.flush_exit.record(Some(5));
        let text = logs.read_all_text(LogSortKey::Type);
        assert!(text.trim_end().ends_with("write size: 5 at exiting workqueue"));
    }

    #[test]
    fn test_sort_key_parse() {
        assert_eq!("time".parse::<LogSortKey>(), Ok(LogSortKey::Time));
        assert_eq!("COUNT".parse::<LogSortKey>(), Ok(LogSortKey::Count));
        assert!("size".parse::<LogSortKey>().is_err());
    }
}
