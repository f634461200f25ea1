// src/acquisition/windowed_buffer.rs
//! Bounded FIFO window shared between the acquisition thread and consumers
//!
//! A single mutex guards the whole structure, so multi-element enqueue and dequeue are
//! atomic with respect to every other operation. With a nonzero capacity, inserting into
//! a full buffer evicts the oldest elements, one per inserted element.

use crate::error::BufferError;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Thread-safe windowed ring buffer; capacity 0 means unbounded
#[derive(Debug)]
pub struct WindowedBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> Default for WindowedBuffer<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> WindowedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Buffer holding `seconds` of data for `channels` channels sampled at `sample_rate_hz`
    pub fn for_window(seconds: u32, sample_rate_hz: u16, channels: usize) -> Result<Self, BufferError> {
        let capacity = (seconds as usize)
            .checked_mul(usize::from(sample_rate_hz))
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(|| {
                BufferError::InvalidArgument(format!(
                    "window of {}s at {} Hz over {} channels overflows",
                    seconds, sample_rate_hz, channels
                ))
            })?;
        if capacity == 0 {
            return Err(BufferError::InvalidArgument(
                "window must hold at least one element".to_string(),
            ));
        }
        Ok(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Free space; `usize::MAX` when unbounded
    pub fn available(&self) -> usize {
        let len = self.inner.lock().len();
        self.free_after(len)
    }

    fn free_after(&self, len: usize) -> usize {
        if self.is_bounded() {
            self.capacity.saturating_sub(len)
        } else {
            usize::MAX
        }
    }

    /// Append one element, evicting the oldest if full
    pub fn enqueue(&self, item: T) {
        let mut queue = self.inner.lock();
        if self.is_bounded() && queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
    }

    /// Remove and return the oldest element
    pub fn dequeue(&self) -> Result<T, BufferError> {
        self.inner.lock().pop_front().ok_or(BufferError::Empty)
    }

    /// Remove up to `n` oldest elements
    pub fn dequeue_many(&self, n: usize) -> Vec<T> {
        let mut queue = self.inner.lock();
        let take = n.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<T: Clone> WindowedBuffer<T> {
    /// Append a block, evicting as many of the oldest elements as needed
    pub fn enqueue_slice(&self, items: &[T]) {
        let mut queue = self.inner.lock();
        if !self.is_bounded() {
            queue.extend(items.iter().cloned());
            return;
        }

        if items.len() >= self.capacity {
            queue.clear();
            queue.extend(items[items.len() - self.capacity..].iter().cloned());
            return;
        }

        let overflow = (queue.len() + items.len()).saturating_sub(self.capacity);
        queue.drain(..overflow);
        queue.extend(items.iter().cloned());
    }

    /// Append a block only if it fits entirely; never evicts
    ///
    /// The free-space check and the insertion happen under the same lock.
    pub fn try_enqueue_slice(&self, items: &[T]) -> Result<(), BufferError> {
        let mut queue = self.inner.lock();
        let available = self.free_after(queue.len());
        if items.len() > available {
            return Err(BufferError::Overflow {
                capacity: self.capacity,
                available,
                incoming: items.len(),
            });
        }
        queue.extend(items.iter().cloned());
        Ok(())
    }

    /// Copy of the `index`-th oldest element
    pub fn get(&self, index: usize) -> Result<T, BufferError> {
        let queue = self.inner.lock();
        queue.get(index).cloned().ok_or(BufferError::IndexOutOfRange {
            index,
            count: queue.len(),
        })
    }

    /// Up to `n` most recent elements, oldest first; nothing is removed
    pub fn peek_newest(&self, n: usize) -> Vec<T> {
        let queue = self.inner.lock();
        let skip = queue.len().saturating_sub(n);
        queue.iter().skip(skip).cloned().collect()
    }

    /// Snapshot of the whole content, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.lock().iter().cloned().collect()
    }
}
