use crate::error::MonitorResult;
use log::{debug, error};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Named background thread that can be joined with a deadline.
pub(crate) struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> MonitorResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = channel();
        let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            body();
            let _ = done_tx.send(());
        })?;
        Ok(Worker {
            name: name.to_string(),
            handle: Some(handle),
            done: done_rx,
        })
    }

    /// Waits up to `timeout`. A thread that does not finish in time is detached and `false`
    /// is returned.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> bool {
        let finished = match self.done.recv_timeout(timeout) {
            Ok(()) => true,
            // sender dropped without a message: the body panicked
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        match self.handle.take() {
            Some(handle) if finished => {
                if handle.join().is_err() {
                    error!("Worker {} panicked", self.name);
                } else {
                    debug!("Worker {} joined", self.name);
                }
                true
            }
            _ => {
                error!("Worker {} did not stop within {:?}, detaching", self.name, timeout);
                false
            }
        }
    }
}
