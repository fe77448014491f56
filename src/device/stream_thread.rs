use crate::error::{MonitorError, MonitorResult};
use log::{debug, warn};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread that owns a device handle which must not leave the thread that created it.
/// The body reports its start-up result once through `ready` and then runs until cancelled.
pub(crate) struct StreamThread {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    pub(crate) fn spawn<F>(name: &str, body: F) -> MonitorResult<Self>
    where
        F: FnOnce(CancellationToken, SyncSender<MonitorResult<()>>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = sync_channel(1);
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(token, ready_tx))?;
        let mut thread = StreamThread {
            cancel,
            handle: Some(handle),
        };
        match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(())) => Ok(thread),
            Ok(Err(e)) => {
                thread.stop();
                Err(e)
            }
            Err(_) => {
                thread.stop();
                Err(MonitorError::Device(format!("{} did not start", name)))
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Stream thread panicked");
            } else {
                debug!("Stream thread finished");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_until_stopped() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut thread = StreamThread::spawn("test-stream", move |cancel, ready| {
            let _ = ready.send(Ok(()));
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!finished.load(Ordering::SeqCst));
        thread.stop();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn start_failure_is_reported() {
        let result = StreamThread::spawn("failing-stream", |_, ready| {
            let _ = ready.send(Err(MonitorError::Device("no mic".to_string())));
        });
        assert!(matches!(result, Err(MonitorError::Device(msg)) if msg == "no mic"));
    }
}
