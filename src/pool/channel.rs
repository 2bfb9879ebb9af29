//! Bounded multi-producer / multi-consumer queue with timed pops.
//!
//! This is the only structure the pool shares between tasks. Every
//! mutation happens under one short, non-async lock; waiting happens on a
//! [`Notify`] outside the lock.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// Why a pop returned without an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived before the deadline. Retryable.
    Timeout,
    /// The channel was closed. Permanent.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedChannel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    available: Notify,
}

impl<T> BoundedChannel<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panic while holding the lock cannot leave the queue half-updated.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Push without waiting. The item is handed back when the channel is full or closed.
    ///
    /// # Errors
    /// Returns `Err(item)` if the item was not queued.
    pub fn push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.lock();
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop an item, waiting at most `wait` for one to be pushed.
    ///
    /// # Errors
    /// [`PopError::Timeout`] if the deadline passes, [`PopError::Closed`] once closed.
    pub async fn pop(&self, wait: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop()? {
                return Ok(item);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return self.try_pop()?.ok_or(PopError::Timeout);
            }
        }
    }

    fn try_pop(&self) -> Result<Option<T>, PopError> {
        let mut state = self.lock();
        if let Some(item) = state.items.pop_front() {
            return Ok(Some(item));
        }
        if state.closed {
            return Err(PopError::Closed);
        }
        Ok(None)
    }

    /// Close the channel and wake every waiter. Queued items are dropped.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.items.clear();
        }
        self.available.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
