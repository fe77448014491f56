use crate::converters::samples_to_bytes;
use crate::device::stream_thread::StreamThread;
use crate::device::{AudioBackend, PcmFormat};
use crate::error::{MonitorError, MonitorResult};
use log::{debug, info, warn};
use pv_recorder::PvRecorderBuilder;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread::sleep;
use std::time::Duration;

const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Mono capture through pv_recorder. The recorder lives on its own thread and hands blocks over
/// a channel.
pub struct PvRecorderBackend {
    device_index: i32,
    format: PcmFormat,
    blocks: Option<Receiver<MonitorResult<Vec<u8>>>>,
    thread: Option<StreamThread>,
}

impl PvRecorderBackend {
    pub fn new(device_index: i32, format: PcmFormat) -> Self {
        PvRecorderBackend {
            device_index,
            format: PcmFormat::mono(format.sample_rate, format.block_size),
            blocks: None,
            thread: None,
        }
    }
}

pub fn available_devices() -> MonitorResult<Vec<String>> {
    PvRecorderBuilder::default()
        .get_available_devices()
        .map_err(|e| MonitorError::Device(format!("{:?}", e)))
}

impl AudioBackend for PvRecorderBackend {
    fn name(&self) -> String {
        format!("pv_recorder:{}", self.device_index)
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> MonitorResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let (tx, rx) = channel();
        let device_index = self.device_index;
        let format = self.format;
        let thread = StreamThread::spawn("pv-recorder", move |cancel, ready| {
            let recorder = match PvRecorderBuilder::new(format.block_size as _).device_index(device_index).init() {
                Ok(r) => r,
                Err(e) => {
                    let _ = ready.send(Err(MonitorError::Device(format!("PV recorder init error {:?}", e))));
                    return;
                }
            };
            info!("Mic device: {}", recorder.selected_device());
            let rate = recorder.sample_rate() as u32;
            if rate != format.sample_rate {
                let _ = ready.send(Err(MonitorError::Config(format!(
                    "pv_recorder runs at {} Hz, {} Hz requested",
                    rate, format.sample_rate
                ))));
                return;
            }
            if let Err(e) = recorder.start() {
                let _ = ready.send(Err(MonitorError::Device(format!("Failed to start audio recording {:?}", e))));
                return;
            }
            let _ = ready.send(Ok(()));

            while !cancel.is_cancelled() {
                match recorder.read() {
                    Ok(frame) => {
                        if tx.send(Ok(samples_to_bytes(&frame))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if tx.send(Err(MonitorError::Device(format!("Error reading chunk {:?}", e)))).is_err() {
                            break;
                        }
                        sleep(ERROR_BACKOFF);
                    }
                }
            }
            if let Err(e) = recorder.stop() {
                warn!("Error stopping recorder {:?}", e);
            }
            debug!("pv_recorder thread done");
        })?;
        self.blocks = Some(rx);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> MonitorResult<()> {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
        }
        self.blocks = None;
        Ok(())
    }

    fn read(&mut self) -> MonitorResult<Vec<u8>> {
        let blocks = self
            .blocks
            .as_ref()
            .ok_or_else(|| MonitorError::Device("pv_recorder not started".to_string()))?;
        match blocks.recv_timeout(self.format.block_duration() * 4) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => Ok(vec![]),
            Err(RecvTimeoutError::Disconnected) => Err(MonitorError::Device("pv_recorder stream ended".to_string())),
        }
    }

    fn write(&mut self, _pcm: &[u8]) -> MonitorResult<()> {
        Err(MonitorError::Unsupported("pv_recorder cannot play audio".to_string()))
    }
}
