//! Fixed-capacity FIFO used for both the byte channel and the log streams.
//!
//! The buffer never overwrites: once it holds `capacity` elements, further
//! pushes are rejected and the element is handed back to the caller. What the
//! caller does with a rejected element (count it, drop it silently) is a
//! policy of the owning type, not of the buffer.
//!
//! `RingBuffer` is not synchronized. Owners wrap it in a lock sized to their
//! access pattern.

use std::collections::VecDeque;

/// Bounded FIFO queue with drop-on-full semantics.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be greater than 0");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no elements are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when a push would be rejected.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Free slots left.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.items.len()
    }

    /// Append one element at the back.
    ///
    /// Returns the element back in `Err` when the buffer is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Move the oldest element out.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Borrow the oldest element without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Drop the oldest `n` elements (or all of them if fewer are queued).
    ///
    /// Returns the number of elements removed.
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.items.len());
        self.items.drain(..n);
        n
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Copy> RingBuffer<T> {
    /// Append as many elements of `items` as fit, in order.
    ///
    /// Returns the number accepted; the tail that did not fit is dropped.
    pub fn push_slice(&mut self, items: &[T]) -> usize {
        let accepted = items.len().min(self.available());
        self.items.extend(&items[..accepted]);
        accepted
    }

    /// Copy up to `n` of the oldest elements without removing them.
    pub fn peek_slice(&self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        let (front, back) = self.items.as_slices();
        let mut out = Vec::with_capacity(n);
        if n <= front.len() {
            out.extend_from_slice(&front[..n]);
        } else {
            out.extend_from_slice(front);
            out.extend_from_slice(&back[..n - front.len()]);
        }
        out
    }

    /// Move up to `n` of the oldest elements out.
    pub fn pop_slice(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut rb = RingBuffer::new(4);
        rb.push(1).unwrap();
        rb.push(2).unwrap();
        rb.push(3).unwrap();
        assert_eq!(rb.pop(), Some(1));
        assert_eq!(rb.pop(), Some(2));
        rb.push(4).unwrap();
        assert_eq!(rb.pop(), Some(3));
        assert_eq!(rb.pop(), Some(4));
        assert_eq!(rb.pop(), None);
    }

    #[test]
    fn test_push_on_full_rejects_newest() {
        let mut rb = RingBuffer::new(2);
        rb.push("a").unwrap();
        rb.push("b").unwrap();
        assert!(rb.is_full());
        assert_eq!(rb.push("c"), Err("c"));

        // Older entries are untouched
        assert_eq!(rb.len(), 2);
        assert_eq!(rb.peek(), Some(&"a"));
    }

    #[test]
    fn test_push_slice_truncates() {
        let mut rb = RingBuffer::new(8);
        assert_eq!(rb.push_slice(b"HELLO"), 5);
        assert_eq!(rb.push_slice(b"WORLD"), 3);
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.pop_slice(8), b"HELLOWOR".to_vec());
    }

    #[test]
    fn test_peek_slice_across_wrap() {
        let mut rb = RingBuffer::new(6);
        rb.push_slice(b"abcdef");
        rb.discard(4);
        rb.push_slice(b"ghij");

        // Storage has wrapped; peek must still return logical order
        assert_eq!(rb.peek_slice(6), b"efghij".to_vec());
        assert_eq!(rb.peek_slice(3), b"efg".to_vec());
        assert_eq!(rb.len(), 6);
    }

    #[test]
    fn test_discard_more_than_len() {
        let mut rb = RingBuffer::new(4);
        rb.push_slice(&[1u8, 2]);
        assert_eq!(rb.discard(10), 2);
        assert!(rb.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than 0")]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }
}
