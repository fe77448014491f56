use circular_buffer::CircularBuffer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const QUEUE_CAPACITY: usize = 100;

/// Bounded FIFO shared between one producer thread and its consumers.
///
/// Pushing never blocks: when the queue is full the oldest element is evicted so the newest
/// one always fits. Consumers either poll with [`try_pop`](Self::try_pop) or wait a bounded
/// time with [`pop_timeout`](Self::pop_timeout).
pub struct DropOldestQueue<T, const N: usize = QUEUE_CAPACITY> {
    buffer: Mutex<Box<CircularBuffer<N, T>>>,
    available: Condvar,
    dropped: AtomicU64,
}

impl<T, const N: usize> DropOldestQueue<T, N> {
    pub fn new() -> Self {
        DropOldestQueue {
            buffer: Mutex::new(CircularBuffer::<N, T>::boxed()),
            available: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<CircularBuffer<N, T>>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when an older element had to be evicted.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut buffer = self.lock();
            let full = buffer.len() == N;
            buffer.push_back(item);
            full
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let buffer = self.lock();
        let (mut buffer, _) = self
            .available
            .wait_timeout_while(buffer, timeout, |b| b.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        buffer.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Number of elements evicted by overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T, const N: usize> Default for DropOldestQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn overflow_keeps_newest() {
        let queue = DropOldestQueue::<u32, 3>::new();
        for i in 0..3 {
            assert!(!queue.push(i));
        }
        assert!(queue.push(3));
        assert!(queue.push(4));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), Some(4));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn newest_is_retrievable_right_after_overflow() {
        let queue = DropOldestQueue::<u32, 2>::new();
        for i in 0..10 {
            queue.push(100);
            queue.push(101);
            assert!(queue.push(i));
            let drained: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).collect();
            assert_eq!(drained, vec![101, i]);
        }
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue = DropOldestQueue::<u32>::new();
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::<u32>::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(7);
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(2)), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn clear_empties() {
        let queue = DropOldestQueue::<u32>::new();
        queue.push(1);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), QUEUE_CAPACITY);
    }
}
