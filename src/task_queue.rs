//! Bounded per-worker task queue
//!
//! A FIFO with a fixed capacity, owned by exactly one worker. Producers
//! block (or fail fast, or time out) while it is full, which is what
//! paces the trace reader to the speed of the workers. Each queue has its
//! own lock, so contention never spans more than one worker.
//!
//! Closing is one-way: after [`TaskQueue::close`] enqueue fails and
//! dequeue drains what is left, then returns `None`.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::constants::TASK_BUFFER_PER_THREAD;

/// Why an item was not enqueued. The item is handed back.
pub enum QueueError<T> {
    /// The queue was closed (end of trace or cancellation)
    Closed(T),
    /// The queue was full and the caller asked not to wait
    Full(T),
    /// The queue stayed full for the whole timeout
    TimedOut(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Closed(t) | QueueError::Full(t) | QueueError::TimedOut(t) => t,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed(_) => f.write_str("Closed(..)"),
            QueueError::Full(_) => f.write_str("Full(..)"),
            QueueError::TimedOut(_) => f.write_str("TimedOut(..)"),
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed(_) => f.write_str("queue is closed"),
            QueueError::Full(_) => f.write_str("queue is full"),
            QueueError::TimedOut(_) => f.write_str("timed out waiting for queue space"),
        }
    }
}

impl<T> std::error::Error for QueueError<T> {}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    peak: usize,
}

/// Fixed-capacity blocking FIFO.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                peak: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Highest number of items ever held at once
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    /// Enqueue, blocking while the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError<T>> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return Err(QueueError::Closed(item));
            }
            if st.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut st);
        }
        self.push_locked(&mut st, item);
        Ok(())
    }

    /// Enqueue, blocking at most `timeout` while the queue is full.
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError<T>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return Err(QueueError::Closed(item));
            }
            if st.items.len() < self.capacity {
                break;
            }
            if self.not_full.wait_until(&mut st, deadline).timed_out() {
                if st.closed {
                    return Err(QueueError::Closed(item));
                }
                if st.items.len() < self.capacity {
                    break;
                }
                return Err(QueueError::TimedOut(item));
            }
        }
        self.push_locked(&mut st, item);
        Ok(())
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), QueueError<T>> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(QueueError::Closed(item));
        }
        if st.items.len() >= self.capacity {
            return Err(QueueError::Full(item));
        }
        self.push_locked(&mut st, item);
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty. `None` once the queue is
    /// closed and drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut st = self.state.lock();
        loop {
            if let Some(item) = st.items.pop_front() {
                drop(st);
                self.not_full.notify_one();
                return Some(item);
            }
            if st.closed {
                return None;
            }
            self.not_empty.wait(&mut st);
        }
    }

    /// No more items will be enqueued. Pending items still drain.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close and throw away everything still pending. Returns how many
    /// items were discarded.
    pub fn abort(&self) -> usize {
        let discarded = {
            let mut st = self.state.lock();
            st.closed = true;
            let n = st.items.len();
            st.items.clear();
            n
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded
    }

    fn push_locked(&self, st: &mut QueueState<T>, item: T) {
        st.items.push_back(item);
        st.peak = st.peak.max(st.items.len());
        self.not_empty.notify_one();
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new(TASK_BUFFER_PER_THREAD)
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("len", &st.items.len())
            .field("capacity", &self.capacity)
            .field("peak", &st.peak)
            .field("closed", &st.closed)
            .finish()
    }
}
