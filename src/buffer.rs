//! Shared receive buffer fed by a background read pump.
//!
//! The session engine reads framed messages off a `tokio::sync::Mutex`
//! that already guarantees at most one request in flight; the socket's
//! read half, though, needs to keep draining even between requests so
//! the device never blocks on a full TCP send buffer. A small pump task
//! owns the read half and appends bytes here; `find_frame` then scans
//! and consumes complete frames the way `protocol::find_prefix` expects.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A byte buffer shared between a read-pump task and whatever is trying
/// to parse frames out of it. `parking_lot::Mutex` guards the bytes
/// (short, synchronous critical sections only); `Notify` wakes parsers
/// blocked waiting for more bytes to arrive.
#[derive(Clone)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<VecDeque<u8>>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the underlying socket as closed/errored. Wakes any waiter so
    /// it can observe the close instead of blocking until its timeout.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Appends bytes read off the socket and wakes any waiting parser.
    pub fn push(&self, data: &[u8]) {
        self.bytes.lock().extend(data.iter().copied());
        self.notify.notify_waiters();
    }

    /// Returns a snapshot of the currently buffered bytes without
    /// consuming them.
    pub fn peek(&self) -> Vec<u8> {
        self.bytes.lock().iter().copied().collect()
    }

    /// Removes and returns the first `n` bytes. Panics if fewer than `n`
    /// bytes are buffered; callers must `peek` first to know how much is
    /// available.
    pub fn consume(&self, n: usize) -> Vec<u8> {
        let mut guard = self.bytes.lock();
        assert!(guard.len() >= n, "consume: not enough buffered bytes");
        guard.drain(..n).collect()
    }

    /// Discards the first `n` bytes (leading junk before a resynchronized
    /// frame prefix).
    pub fn discard(&self, n: usize) {
        let mut guard = self.bytes.lock();
        let n = n.min(guard.len());
        guard.drain(..n);
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the pump appends more bytes (or a spurious wakeup
    /// occurs — callers must re-check their condition after returning).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_consume_round_trip() {
        let buf = SharedBuffer::new();
        buf.push(b"hello world");
        assert_eq!(buf.len(), 11);
        let head = buf.consume(5);
        assert_eq!(head, b"hello");
        assert_eq!(buf.peek(), b" world");
    }

    #[test]
    fn discard_drops_leading_bytes() {
        let buf = SharedBuffer::new();
        buf.push(b"junkDATA");
        buf.discard(4);
        assert_eq!(buf.peek(), b"DATA");
    }

    #[tokio::test]
    async fn notified_wakes_after_push() {
        let buf = SharedBuffer::new();
        let waiter = buf.clone();
        let handle = tokio::spawn(async move {
            waiter.notified().await;
            waiter.len()
        });
        tokio::task::yield_now().await;
        buf.push(b"abc");
        let len = handle.await.unwrap();
        assert_eq!(len, 3);
    }
}
