use crate::alarm::AlarmEvent;
use crate::frame::AudioFrame;
use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

pub type ObserverId = u64;

/// Receives every processed capture frame, on the capture thread.
pub trait FrameObserver: Send + Sync {
    fn on_frame(&self, frame: &AudioFrame);
}

impl<F> FrameObserver for F
where
    F: Fn(&AudioFrame) + Send + Sync,
{
    fn on_frame(&self, frame: &AudioFrame) {
        self(frame)
    }
}

/// Receives every alarm trigger, on the thread that raised it.
pub trait AlarmObserver: Send + Sync {
    fn on_alarm(&self, event: &AlarmEvent);
}

impl<F> AlarmObserver for F
where
    F: Fn(&AlarmEvent) + Send + Sync,
{
    fn on_alarm(&self, event: &AlarmEvent) {
        self(event)
    }
}

/// Registered observers. Notification walks a snapshot, so observers may register or
/// unregister from inside a callback, and a panicking observer does not stop the others.
pub struct ObserverList<T: ?Sized> {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<T>)>>,
}

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        ObserverList {
            next_id: AtomicU64::new(1),
            observers: RwLock::new(vec![]),
        }
    }

    pub fn add(&self, observer: Arc<T>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for each observer; returns how many of them panicked.
    pub fn notify<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&T),
    {
        let snapshot: Vec<(ObserverId, Arc<T>)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        let mut failures = 0;
        for (id, observer) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(&observer))).is_err() {
                warn!("Observer {} panicked, continuing", id);
                failures += 1;
            }
        }
        failures
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}
