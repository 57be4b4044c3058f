//! Fixed-capacity byte queue with overwrite-oldest overflow
//!
//! A buffer built with capacity `N` keeps at most `N - 1` unread bytes:
//! `head == tail` means empty and `(tail + 1) % N == head` means full.
//! Pushing into a full buffer advances `head`, dropping the oldest byte.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Circular byte queue
#[derive(Debug, Clone)]
pub struct RingBuffer {
    slots: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Create a buffer with `capacity` slots (minimum 2)
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity.max(2)].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Number of slots, one more than the number of storable bytes
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append a byte, overwriting the oldest unread byte when full
    pub fn push(&mut self, byte: u8) {
        let n = self.slots.len();
        self.slots[self.tail] = byte;
        self.tail = (self.tail + 1) % n;
        if self.tail == self.head {
            self.head = (self.head + 1) % n;
        }
    }

    /// Remove the oldest byte
    pub fn pop(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let byte = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        Some(byte)
    }

    /// Unread byte count
    pub fn available(&self) -> usize {
        let n = self.slots.len();
        (self.tail + n - self.head) % n
    }

    /// Bytes that can be pushed before the oldest starts being dropped
    pub fn remaining(&self) -> usize {
        self.slots.len() - 1 - self.available()
    }

    /// True when no byte is waiting
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when the next push would drop a byte
    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.slots.len() == self.head
    }

    /// Pop up to `buf.len()` bytes into `buf`, returning the count
    pub fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while count < buf.len() {
            match self.pop() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Drop every unread byte
    pub fn clear(&mut self) {
        self.head = self.tail;
    }
}

/// A ring buffer shared by one producer and one consumer
///
/// The lock is held only while indices and slots change. `data_ready`
/// fires after a push, `space_ready` after a pop.
#[derive(Debug)]
pub struct SharedRing {
    ring: Mutex<RingBuffer>,
    data_ready: Notify,
    space_ready: Notify,
}

impl SharedRing {
    /// Create a shared buffer with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Push every byte, overwriting the oldest on overflow
    pub fn push_slice(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut ring = self.ring.lock();
            for &byte in bytes {
                ring.push(byte);
            }
        }
        self.data_ready.notify_one();
    }

    /// Push as many bytes as fit without overwriting, returning the count
    pub fn push_available(&self, bytes: &[u8]) -> usize {
        let pushed = {
            let mut ring = self.ring.lock();
            let count = ring.remaining().min(bytes.len());
            for &byte in &bytes[..count] {
                ring.push(byte);
            }
            count
        };
        if pushed > 0 {
            self.data_ready.notify_one();
        }
        pushed
    }

    /// Pop up to `buf.len()` bytes
    pub fn pop_into(&self, buf: &mut [u8]) -> usize {
        let count = self.ring.lock().pop_into(buf);
        if count > 0 {
            self.space_ready.notify_one();
        }
        count
    }

    /// Unread byte count
    pub fn available(&self) -> usize {
        self.ring.lock().available()
    }

    /// Free space before overwriting starts
    pub fn remaining(&self) -> usize {
        self.ring.lock().remaining()
    }

    /// Drop every unread byte
    pub fn clear(&self) {
        self.ring.lock().clear();
        self.space_ready.notify_one();
    }

    /// Resolves after the next push (or immediately if one is pending)
    pub async fn data_ready(&self) {
        self.data_ready.notified().await;
    }

    /// Resolves after the next pop
    pub async fn space_ready(&self) {
        self.space_ready.notified().await;
    }

    /// Wake a task blocked in [`SharedRing::data_ready`]
    pub fn wake_reader(&self) {
        self.data_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let mut ring = RingBuffer::new(8);
        for b in b"abc" {
            ring.push(*b);
        }
        assert_eq!(ring.available(), 3);
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.pop(), Some(b'b'));
        assert_eq!(ring.pop(), Some(b'c'));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_keeps_last_n_minus_one() {
        let n = 16;
        let mut ring = RingBuffer::new(n);
        let pushed: Vec<u8> = (0..40u8).collect();
        for &b in &pushed {
            ring.push(b);
        }
        assert_eq!(ring.available(), n - 1);
        assert!(ring.is_full());

        let mut out = vec![0u8; n];
        let count = ring.pop_into(&mut out);
        assert_eq!(count, n - 1);
        assert_eq!(&out[..count], &pushed[pushed.len() - (n - 1)..]);
    }

    #[test]
    fn test_wraparound() {
        let mut ring = RingBuffer::new(4);
        for round in 0..10u8 {
            ring.push(round);
            ring.push(round.wrapping_add(100));
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round.wrapping_add(100)));
        }
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.remaining(), 3);
    }

    #[test]
    fn test_shared_push_available_does_not_overwrite() {
        let shared = SharedRing::new(4);
        assert_eq!(shared.push_available(b"hello"), 3);
        let mut buf = [0u8; 8];
        assert_eq!(shared.pop_into(&mut buf), 3);
        assert_eq!(&buf[..3], b"hel");
    }

    #[test]
    fn test_minimum_capacity() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.capacity(), 2);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.available(), 1);
        assert_eq!(ring.pop(), Some(2));
    }
}
