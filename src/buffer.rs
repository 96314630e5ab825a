//! Byte-buffer bookkeeping for a connection's input and output sides. Pure
//! data structures — the state machine owns the actual `read`/`write` calls.

use std::collections::VecDeque;

/// Accumulated input with a consumed offset, so callbacks can read without
/// copying and the manager reclaims space only once bytes are consumed.
#[derive(Debug, Default)]
pub struct InBuffer {
    data: Vec<u8>,
    consumed: usize,
}

/// Drop stale bytes once consumed crosses this much, instead of on every
/// `mark_consumed` call.
const COMPACT_THRESHOLD: usize = 64 * 1024;

impl InBuffer {
    pub fn new() -> InBuffer {
        InBuffer::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Advance the consumed offset by `n`. `n` must not exceed the currently
    /// available (unconsumed) length.
    pub fn mark_consumed(&mut self, n: usize) {
        let avail = self.len();
        assert!(
            n <= avail,
            "mark_consumed({n}) exceeds available {avail} bytes"
        );
        self.consumed += n;
        self.compact();
    }

    fn compact(&mut self) {
        if self.consumed == self.data.len() {
            self.data.clear();
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD {
            self.data.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

/// Ordered sequence of byte buffers to write in order; the head buffer may
/// be partially written.
#[derive(Debug, Default)]
pub struct OutQueue {
    queue: VecDeque<Vec<u8>>,
    head_offset: usize,
}

impl OutQueue {
    pub fn new() -> OutQueue {
        OutQueue::default()
    }

    pub fn push(&mut self, buf: Vec<u8>) {
        if !buf.is_empty() {
            self.queue.push_back(buf);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head(&self) -> Option<&[u8]> {
        self.queue.front().map(|buf| &buf[self.head_offset..])
    }

    /// Record that `n` bytes of the head buffer were written, popping it
    /// once fully drained.
    pub fn advance(&mut self, n: usize) {
        let Some(buf) = self.queue.front() else {
            return;
        };
        let remaining = buf.len() - self.head_offset;
        if n >= remaining {
            self.queue.pop_front();
            self.head_offset = 0;
        } else {
            self.head_offset += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_buffer_consume_and_compact() {
        let mut buf = InBuffer::new();
        buf.extend_from_slice(b"hello world");
        assert_eq!(buf.as_slice(), b"hello world");
        buf.mark_consumed(6);
        assert_eq!(buf.as_slice(), b"world");
        buf.mark_consumed(5);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic]
    fn in_buffer_overconsume_panics() {
        let mut buf = InBuffer::new();
        buf.extend_from_slice(b"hi");
        buf.mark_consumed(3);
    }

    #[test]
    fn out_queue_partial_write_advance() {
        let mut q = OutQueue::new();
        q.push(b"abc".to_vec());
        q.push(b"def".to_vec());
        assert_eq!(q.head(), Some(&b"abc"[..]));
        q.advance(1);
        assert_eq!(q.head(), Some(&b"bc"[..]));
        q.advance(2);
        assert_eq!(q.head(), Some(&b"def"[..]));
        q.advance(3);
        assert!(q.is_empty());
    }
}
