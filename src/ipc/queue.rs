//! Buffered producer queue with a feeder thread.
//!
//! `put` only appends to an in-memory buffer; a dedicated feeder thread
//! performs the framed writes. The reading half is a plain [`Connection`],
//! which can be handed to another process.

use super::{Connection, Incoming};
use crate::error::{PoolError, Result};
use crate::heap::Heap;
use crate::sync::{Condition, Semaphore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// `None` is the reserved close sentinel.
type Item = Option<Vec<u8>>;

struct QueueShared {
    buffer: Mutex<VecDeque<Item>>,
    not_empty: Condition,
    capacity: Option<Semaphore>,
    writer: Mutex<Option<Connection>>,
    /// Raw write fd, -1 once the feeder has closed it.
    writer_fd: AtomicI32,
    closed: AtomicBool,
    broken: AtomicBool,
}

/// A framed queue whose producers never block on the underlying pipe.
pub struct Queue {
    shared: Arc<QueueShared>,
    reader: Option<Connection>,
    feeder: Option<JoinHandle<()>>,
}

impl Queue {
    /// Create a queue over a fresh pipe.
    ///
    /// `maxsize` bounds how many messages may sit in the buffer at once;
    /// `name` labels the feeder thread.
    pub fn new(heap: &Arc<Heap>, maxsize: Option<u32>, name: &str) -> Result<Self> {
        let (reader, writer) = Connection::pipe()?;
        let capacity = maxsize.map(|n| Semaphore::bounded(heap, n)).transpose()?;

        let writer_fd = writer.writer_fd().unwrap_or(-1);
        let shared = Arc::new(QueueShared {
            buffer: Mutex::new(VecDeque::new()),
            not_empty: Condition::new(heap)?,
            capacity,
            writer: Mutex::new(Some(writer)),
            writer_fd: AtomicI32::new(writer_fd),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });

        let feeder = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-feeder", name))
                .spawn(move || feeder_loop(&shared))?
        };

        Ok(Self {
            shared,
            reader: Some(reader),
            feeder: Some(feeder),
        })
    }

    /// Serialize `message` and buffer it for the feeder.
    ///
    /// Waits up to `timeout` for buffer capacity when the queue is bounded.
    pub fn put<T: Serialize>(&self, message: &T, timeout: Option<Duration>) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "queue is closed").into());
        }
        let payload = serde_json::to_vec(message)?;
        if let Some(capacity) = &self.shared.capacity
            && !capacity.acquire(timeout)?
        {
            return Err(PoolError::Timeout(timeout.unwrap_or_default()));
        }
        self.push(Some(payload))
    }

    fn push(&self, item: Item) -> Result<()> {
        let _guard = self.shared.not_empty.lock()?;
        lock(&self.shared.buffer).push_back(item);
        self.shared.not_empty.notify(1)?;
        Ok(())
    }

    /// Read the next message from the reading half.
    ///
    /// Returns `Ok(None)` if nothing arrived within `timeout`.
    pub fn get<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<Option<Incoming<T>>> {
        let reader = self.reader.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "queue reader was handed off")
        })?;
        if timeout.is_some() && !reader.poll(timeout)? {
            return Ok(None);
        }
        Ok(Some(reader.recv()?))
    }

    /// Detach the reading half, e.g. to give it to a child process.
    pub fn take_reader(&mut self) -> Option<Connection> {
        self.reader.take()
    }

    /// Enqueue the close sentinel. The feeder writes a sentinel frame,
    /// closes the write end and exits once everything before it is flushed.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.push(None)
    }

    /// Wait for the feeder thread to finish.
    pub fn join_feeder(&mut self) {
        if let Some(handle) = self.feeder.take()
            && handle.join().is_err()
        {
            warn!("Queue feeder thread panicked");
        }
    }

    /// Raw write-end descriptor, `None` once the feeder has closed it.
    pub fn writer_fd(&self) -> Option<RawFd> {
        let fd = self.shared.writer_fd.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }

    pub fn reader_fd(&self) -> Option<RawFd> {
        self.reader.as_ref().and_then(Connection::reader_fd)
    }

    /// Messages buffered but not yet written.
    pub fn buffered(&self) -> usize {
        lock(&self.shared.buffer)
            .iter()
            .filter(|item| item.is_some())
            .count()
    }

    /// Whether a write to the pipe has failed (peer gone).
    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::SeqCst)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = self.close();
        self.join_feeder();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_item(shared: &QueueShared) -> Result<Item> {
    let _guard = shared.not_empty.lock()?;
    loop {
        if let Some(item) = lock(&shared.buffer).pop_front() {
            return Ok(item);
        }
        shared.not_empty.wait(None)?;
    }
}

fn feeder_loop(shared: &QueueShared) {
    loop {
        let item = match next_item(shared) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Queue feeder stopped");
                break;
            }
        };
        let writer = lock(&shared.writer);
        let Some(conn) = writer.as_ref() else {
            break;
        };
        match item {
            Some(payload) => {
                if let Some(capacity) = &shared.capacity {
                    let _ = capacity.release();
                }
                if shared.broken.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = conn.send_bytes(&payload) {
                    debug!(error = %e, "Queue feeder write failed; discarding remaining items");
                    shared.broken.store(true, Ordering::SeqCst);
                }
            }
            None => {
                if !shared.broken.load(Ordering::SeqCst) {
                    let _ = conn.send_sentinel();
                }
                break;
            }
        }
    }
    shared.writer_fd.store(-1, Ordering::SeqCst);
    lock(&shared.writer).take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_preserves_order() {
        let heap = Arc::new(Heap::new());
        let queue = Queue::new(&heap, None, "test").unwrap();
        for i in 0..20u32 {
            queue.put(&i, None).unwrap();
        }
        for i in 0..20u32 {
            let got = queue.get::<u32>(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(got, Some(Incoming::Message(i)));
        }
    }

    #[test]
    fn test_close_sends_sentinel_then_eof() {
        let heap = Arc::new(Heap::new());
        let mut queue = Queue::new(&heap, None, "test").unwrap();
        queue.put(&"last", None).unwrap();
        queue.close().unwrap();
        queue.join_feeder();

        assert_eq!(
            queue.get::<String>(None).unwrap(),
            Some(Incoming::Message("last".to_string()))
        );
        assert_eq!(queue.get::<String>(None).unwrap(), Some(Incoming::Sentinel));
        assert_eq!(queue.get::<String>(None).unwrap(), Some(Incoming::Closed));
        assert!(queue.put(&"late", None).is_err());
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let heap = Arc::new(Heap::new());
        let queue = Queue::new(&heap, None, "test").unwrap();
        let got = queue.get::<u32>(Some(Duration::from_millis(20))).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_put_does_not_block_on_full_pipe() {
        let heap = Arc::new(Heap::new());
        let queue = Queue::new(&heap, None, "test").unwrap();
        // Far more than a pipe buffer holds; nobody is reading yet.
        let blob = "x".repeat(64 * 1024);
        for _ in 0..8 {
            queue.put(&blob, None).unwrap();
        }
        for _ in 0..8 {
            let got = queue.get::<String>(Some(Duration::from_secs(5))).unwrap();
            assert!(matches!(got, Some(Incoming::Message(s)) if s.len() == blob.len()));
        }
    }

    #[test]
    fn test_broken_reader_marks_queue() {
        let heap = Arc::new(Heap::new());
        let mut queue = Queue::new(&heap, None, "test").unwrap();
        drop(queue.take_reader());
        queue.put(&1u8, None).unwrap();
        queue.close().unwrap();
        queue.join_feeder();
        assert!(queue.is_broken());
        assert!(queue.writer_fd().is_none());
    }
}
