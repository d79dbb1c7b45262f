//! Byte channel between the writer path and the flush worker.
//!
//! Writers append with [`DataChannel::write`] at any time. The flush worker
//! copies the head of the queue with [`DataChannel::peek`], hands it to the
//! sink, and then [`DataChannel::consume`]s only the bytes the sink actually
//! took, so a short write leaves the remainder queued for the next cycle.
//!
//! Only one consumer may use `peek`/`consume` at a time; the device enforces
//! this with its flush lock. The internal byte lock is held only for the copy
//! itself, so writers never wait behind a flush cycle.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{trace, warn};

use crate::ring_buffer::RingBuffer;

/// Default channel capacity (1 MiB).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1 << 20;

/// Bounded byte queue with a lock-free "bytes waiting" counter.
#[derive(Debug)]
pub struct DataChannel {
    buffer: Mutex<RingBuffer<u8>>,
    bytes_waiting: AtomicUsize,
    bytes_dropped: AtomicU64,
}

impl DataChannel {
    /// Create a channel holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(capacity)),
            bytes_waiting: AtomicUsize::new(0),
            bytes_dropped: AtomicU64::new(0),
        }
    }

    /// Maximum number of bytes the channel can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    /// Append as much of `data` as fits.
    ///
    /// Returns the number of bytes accepted. A partial acceptance is not an
    /// error: the dropped tail is counted and reported as a warning.
    pub fn write(&self, data: &[u8]) -> usize {
        let accepted = {
            let mut buffer = self.buffer.lock();
            let accepted = buffer.push_slice(data);
            self.bytes_waiting.fetch_add(accepted, Ordering::SeqCst);
            accepted
        };

        if accepted < data.len() {
            let dropped = data.len() - accepted;
            self.bytes_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(
                requested = data.len(),
                accepted, dropped, "Data channel full, bytes dropped"
            );
        } else {
            trace!(accepted, "Bytes buffered");
        }

        accepted
    }

    /// Copy up to `n` bytes from the head of the queue without removing them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        self.buffer.lock().peek_slice(n)
    }

    /// Remove `n` bytes from the head of the queue.
    ///
    /// Returns the number of bytes removed, which is less than `n` only if
    /// fewer were queued.
    pub fn consume(&self, n: usize) -> usize {
        let mut buffer = self.buffer.lock();
        let removed = buffer.discard(n);
        self.bytes_waiting.fetch_sub(removed, Ordering::SeqCst);
        removed
    }

    /// Drop everything queued and reset the waiting counter.
    ///
    /// Returns the number of bytes discarded.
    pub fn clear(&self) -> usize {
        let mut buffer = self.buffer.lock();
        let discarded = buffer.len();
        buffer.clear();
        self.bytes_waiting.store(0, Ordering::SeqCst);
        discarded
    }

    /// Bytes accepted but not yet flushed.
    pub fn bytes_waiting(&self) -> usize {
        self.bytes_waiting.load(Ordering::SeqCst)
    }

    /// Bytes currently held by the ring buffer.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.bytes_waiting() == 0
    }

    /// Free space left.
    pub fn available(&self) -> usize {
        self.buffer.lock().available()
    }

    /// Total bytes refused by [`write`](Self::write) because the channel was full.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }
}

impl Default for DataChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
