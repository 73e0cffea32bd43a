//! FIFO queue of outbound byte chunks awaiting transmission (§3, §4.3).
//! `write` is the facade-side producer, blocking on a condition variable
//! when the queue is full; the I/O worker is the sole drainer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::packet::MAX_DATA;

/// Bound on the number of MAX_DATA-sized chunks queued for transmission.
pub const MAX_SEND_QUEUE: usize = 128;

struct Inner {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Bounded FIFO of pending outbound chunks, shared between one facade
/// producer and the I/O worker consumer.
pub struct SendQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Splits `data` into MAX_DATA-sized chunks and pushes them, blocking on
    /// the queue-has-space condition whenever the queue is full. A write of
    /// zero bytes returns immediately without enqueueing anything (§8).
    /// Returns `false` if the queue was closed (connection became terminal)
    /// before all chunks could be pushed.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        for chunk in data.chunks(MAX_DATA) {
            let mut inner = self.inner.lock().unwrap();
            while inner.chunks.len() >= MAX_SEND_QUEUE && !inner.closed {
                inner = self.not_full.wait(inner).unwrap();
            }
            if inner.closed {
                return false;
            }
            inner.chunks.push_back(chunk.to_vec());
            self.not_empty.notify_one();
        }

        true
    }

    /// Pops the next chunk for the I/O worker to transmit, if any. Never
    /// blocks — the worker polls this on its own schedule.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let chunk = inner.chunks.pop_front();
        if chunk.is_some() {
            self.not_full.notify_one();
        }
        chunk
    }

    /// Puts a chunk back at the front, used when a `sendto` fails with
    /// EAGAIN after the worker already popped it (§4.5 step 5).
    pub fn push_front(&self, chunk: Vec<u8>) {
        self.inner.lock().unwrap().chunks.push_front(chunk);
    }

    /// True when there is nothing left for the worker to drain.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().chunks.is_empty()
    }

    /// Wakes any facade thread blocked in `write`, used when the connection
    /// is closing and further progress is impossible.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_full.notify_all();
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        SendQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn splits_large_write_into_max_data_chunks() {
        let queue = SendQueue::new();
        queue.write(&vec![7u8; MAX_DATA * 3 + 10]);

        let mut total = 0;
        let mut count = 0;
        while let Some(chunk) = queue.pop() {
            assert!(chunk.len() <= MAX_DATA);
            total += chunk.len();
            count += 1;
        }
        assert_eq!(total, MAX_DATA * 3 + 10);
        assert_eq!(count, 4);
    }

    #[test]
    fn zero_byte_write_enqueues_nothing() {
        let queue = SendQueue::new();
        queue.write(&[]);
        assert!(queue.is_empty());
    }

    #[test]
    fn write_blocks_until_queue_drains() {
        let queue = Arc::new(SendQueue::new());
        for _ in 0..MAX_SEND_QUEUE {
            queue.write(&[1]);
        }
        assert!(!queue.is_empty());

        let writer_queue = queue.clone();
        let writer = thread::spawn(move || {
            writer_queue.write(&[2]);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        queue.pop();
        writer.join().unwrap();
    }
}
