use crate::converters::{bytes_to_samples, f32_to_i16, i16_to_f32, samples_to_bytes};
use crate::device::cpal_config::find_best_config;
use crate::device::stream_thread::StreamThread;
use crate::device::{AudioBackend, PcmFormat, StreamDirection};
use crate::error::{MonitorError, MonitorResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant};

const CALLBACK_QUEUE: usize = 64;
const OUTPUT_BLOCKS_AHEAD: usize = 4;

type Samples = Arc<Mutex<VecDeque<i16>>>;

/// Default cpal device. `cpal::Stream` is not `Send`, so the stream is built and kept on a
/// helper thread; samples cross over through channels.
pub struct CpalBackend {
    direction: StreamDirection,
    format: PcmFormat,
    device_name: String,
    incoming: Option<Receiver<Vec<i16>>>,
    pending: Vec<i16>,
    outgoing: Samples,
    thread: Option<StreamThread>,
}

pub fn default_device_name(direction: StreamDirection) -> MonitorResult<String> {
    let host = cpal::default_host();
    let device = match direction {
        StreamDirection::Capture => host.default_input_device(),
        StreamDirection::Playback => host.default_output_device(),
    }
    .ok_or_else(|| MonitorError::Device(format!("No {:?} device available", direction)))?;
    device.name().map_err(|e| MonitorError::Device(e.to_string()))
}

pub fn available_input_devices() -> MonitorResult<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|e| MonitorError::Device(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

impl CpalBackend {
    pub fn new(format: PcmFormat, direction: StreamDirection) -> Self {
        CpalBackend {
            direction,
            format,
            device_name: "default".to_string(),
            incoming: None,
            pending: vec![],
            outgoing: Arc::new(Mutex::new(VecDeque::new())),
            thread: None,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> String {
        format!("cpal:{}", self.device_name)
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> MonitorResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let (input_tx, input_rx) = sync_channel::<Vec<i16>>(CALLBACK_QUEUE);
        let (format_tx, format_rx) = sync_channel::<(PcmFormat, String)>(1);
        let direction = self.direction;
        let wanted = self.format;
        let outgoing = self.outgoing.clone();

        let thread = StreamThread::spawn("cpal-stream", move |cancel, ready| {
            let host = cpal::default_host();
            let device = match direction {
                StreamDirection::Capture => host.default_input_device(),
                StreamDirection::Playback => host.default_output_device(),
            };
            let device = match device {
                Some(d) => d,
                None => {
                    let _ = ready.send(Err(MonitorError::Device(format!("No {:?} device available", direction))));
                    return;
                }
            };
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());
            debug!("{:?} device: {}", direction, name);

            info!("Starting to find the best config");
            let (config, sample_format) = match find_best_config(&device, direction, &wanted) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Device not compatible {}", e);
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            info!("Selected {:?} config: {:?}", direction, config);
            let actual = PcmFormat::new(config.sample_rate.0, config.channels, wanted.block_size);

            let err_fn = |err| warn!("An error occurred on the audio stream: {}", err);
            let timeout = Some(Duration::from_millis(80));
            let built = match (direction, sample_format) {
                (StreamDirection::Capture, SampleFormat::F32) => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let _ = input_tx.try_send(data.iter().map(f32_to_i16).collect());
                    },
                    err_fn,
                    timeout,
                ),
                (StreamDirection::Capture, _) => device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let _ = input_tx.try_send(data.to_vec());
                    },
                    err_fn,
                    timeout,
                ),
                (StreamDirection::Playback, SampleFormat::F32) => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = outgoing.lock().unwrap_or_else(PoisonError::into_inner);
                        for s in data.iter_mut() {
                            *s = queue.pop_front().map(|v| i16_to_f32(&v)).unwrap_or(0.0);
                        }
                    },
                    err_fn,
                    timeout,
                ),
                (StreamDirection::Playback, _) => device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let mut queue = outgoing.lock().unwrap_or_else(PoisonError::into_inner);
                        for s in data.iter_mut() {
                            *s = queue.pop_front().unwrap_or(0);
                        }
                    },
                    err_fn,
                    timeout,
                ),
            };
            let stream = match built {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready.send(Err(e.into()));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready.send(Err(e.into()));
                return;
            }
            let _ = format_tx.send((actual, name));
            let _ = ready.send(Ok(()));

            while !cancel.is_cancelled() {
                sleep(Duration::from_millis(100));
            }
            drop(stream);
            debug!("cpal stream closed");
        })?;

        if let Ok((actual, name)) = format_rx.try_recv() {
            if actual != self.format {
                info!("{:?} format negotiated as {:?}", self.direction, actual);
            }
            self.format = actual;
            self.device_name = name;
        }
        self.incoming = Some(input_rx);
        self.pending.clear();
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> MonitorResult<()> {
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
        }
        self.incoming = None;
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn read(&mut self) -> MonitorResult<Vec<u8>> {
        if self.direction != StreamDirection::Capture {
            return Err(MonitorError::Unsupported("playback stream cannot be read".to_string()));
        }
        let incoming = self
            .incoming
            .as_ref()
            .ok_or_else(|| MonitorError::Device("cpal stream not started".to_string()))?;
        let wanted = self.format.block_size * self.format.channels as usize;
        let deadline = Instant::now() + self.format.block_duration() * 4;
        while self.pending.len() < wanted {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(vec![]);
            }
            match incoming.recv_timeout(remaining) {
                Ok(data) => self.pending.extend(data),
                Err(RecvTimeoutError::Timeout) => return Ok(vec![]),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MonitorError::Device("cpal stream ended".to_string()));
                }
            }
        }
        let block: Vec<i16> = self.pending.drain(..wanted).collect();
        Ok(samples_to_bytes(&block))
    }

    fn write(&mut self, pcm: &[u8]) -> MonitorResult<()> {
        if self.direction != StreamDirection::Playback {
            return Err(MonitorError::Unsupported("capture stream cannot be written".to_string()));
        }
        if self.thread.is_none() {
            return Err(MonitorError::Device("cpal stream not started".to_string()));
        }
        let limit = self.format.block_size * self.format.channels as usize * OUTPUT_BLOCKS_AHEAD;
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(bytes_to_samples(pcm));
        // block like a hardware write until the device has drained most of the queue
        while self.outgoing.lock().unwrap_or_else(PoisonError::into_inner).len() > limit {
            sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}
