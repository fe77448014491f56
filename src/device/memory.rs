use crate::converters::{bytes_to_samples, samples_to_bytes};
use crate::device::{AudioBackend, PcmFormat};
use crate::error::{MonitorError, MonitorResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::Duration;

const MIN_READ_WAIT: Duration = Duration::from_millis(10);

/// In-process backend for simulations and tests. Capture blocks are fed through a
/// [`MemoryHandle`]; playback writes are collected and can be inspected from the handle.
pub struct MemoryBackend {
    format: PcmFormat,
    input: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    written: Mutex<Vec<u8>>,
    started: AtomicBool,
    fail_start: AtomicBool,
    failing_reads: AtomicUsize,
    paced_writes: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryHandle {
    input: Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(format: PcmFormat) -> (Self, MemoryHandle) {
        let (tx, rx) = channel();
        let shared = Arc::new(Shared::default());
        let backend = MemoryBackend {
            format,
            input: rx,
            shared: shared.clone(),
        };
        (backend, MemoryHandle { input: tx, shared })
    }
}

impl MemoryHandle {
    /// Queues interleaved samples as one capture block.
    pub fn push_samples(&self, samples: &[i16]) -> bool {
        self.input.send(samples_to_bytes(samples)).is_ok()
    }

    pub fn push_bytes(&self, pcm: Vec<u8>) -> bool {
        self.input.send(pcm).is_ok()
    }

    pub fn written_samples(&self) -> Vec<i16> {
        bytes_to_samples(&self.shared.written.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes `write` take as long as the written audio lasts, like a real sound card.
    pub fn pace_writes(&self, paced: bool) {
        self.shared.paced_writes.store(paced, Ordering::SeqCst);
    }

    /// Makes the next `count` reads return a device error.
    pub fn fail_next_reads(&self, count: usize) {
        self.shared.failing_reads.store(count, Ordering::SeqCst);
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> MonitorResult<()> {
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(MonitorError::Device("memory device unavailable".to_string()));
        }
        self.shared.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> MonitorResult<()> {
        self.shared.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self) -> MonitorResult<Vec<u8>> {
        if !self.shared.started.load(Ordering::SeqCst) {
            return Err(MonitorError::Device("memory device not started".to_string()));
        }
        let failing = self.shared.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(MonitorError::Device("simulated read failure".to_string()));
        }
        let wait = self.format.block_duration().max(MIN_READ_WAIT);
        match self.input.recv_timeout(wait) {
            Ok(block) => Ok(block),
            Err(RecvTimeoutError::Timeout) => Ok(vec![]),
            Err(RecvTimeoutError::Disconnected) => {
                sleep(wait);
                Ok(vec![])
            }
        }
    }

    fn write(&mut self, pcm: &[u8]) -> MonitorResult<()> {
        if !self.shared.started.load(Ordering::SeqCst) {
            return Err(MonitorError::Device("memory device not started".to_string()));
        }
        self.shared
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(pcm);
        if self.shared.paced_writes.load(Ordering::SeqCst) && self.format.sample_rate > 0 {
            let frames = pcm.len() / 2 / (self.format.channels.max(1) as usize);
            sleep(Duration::from_secs_f64(frames as f64 / self.format.sample_rate as f64));
        }
        Ok(())
    }
}
