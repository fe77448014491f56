use crate::config::{AudioConfig, EchoConfig, NoiseConfig};
use crate::converters::{bytes_to_samples, downmix};
use crate::device::AudioBackend;
use crate::dsp::{EchoCanceller, NoiseReducer};
use crate::error::{MonitorError, MonitorResult};
use crate::frame::{AudioFrame, ReferenceFrame};
use crate::observer::{FrameObserver, ObserverId, ObserverList};
use crate::queue::DropOldestQueue;
use crate::reference_bus::PlaybackReferenceBus;
use crate::save::save_wav;
use crate::worker::Worker;
use log::{debug, info, trace, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::sleep;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(1);

/// Anything the alarm manager can pull audio from.
pub trait AudioSource: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Blocks until `duration` worth of samples arrived or a read timed out; may return fewer.
    fn get_buffer(&self, duration: Duration) -> Vec<i16>;

    fn record_clip(&self, duration: Duration, path: &Path) -> MonitorResult<PathBuf>;
}

/// Filter state and devices. Owned by the capture thread while it runs.
struct Pipeline {
    primary: Box<dyn AudioBackend>,
    secondary: Option<Box<dyn AudioBackend>>,
    echo: Option<EchoCanceller>,
    noise: Option<NoiseReducer>,
}

impl Pipeline {
    fn process(&mut self, mono: Vec<i16>, second_mic: Option<&[i16]>, reference: Option<ReferenceFrame>) -> Vec<i16> {
        let mut samples = mono;
        if let Some(echo) = &mut self.echo {
            samples = echo.cancel(&samples, reference.as_ref().map(|r| r.samples()));
        }
        if let Some(noise) = &mut self.noise {
            samples = noise.reduce(&samples, second_mic);
        }
        samples
    }
}

struct Running {
    cancel: CancellationToken,
    worker: Worker,
}

/// Capture thread plus the bounded queue of processed mono frames it fills.
pub struct AudioCapture {
    pipeline: Arc<Mutex<Pipeline>>,
    bus: Option<Arc<PlaybackReferenceBus>>,
    frames: Arc<DropOldestQueue<AudioFrame>>,
    observers: Arc<ObserverList<dyn FrameObserver>>,
    sample_rate: Arc<AtomicU32>,
    recording: Arc<AtomicBool>,
    dual_mic: AtomicBool,
    noise_reduction: bool,
    dual_mic_requested: bool,
    echo_cancellation: bool,
    run: Mutex<Option<Running>>,
}

impl AudioCapture {
    pub fn new(
        config: AudioConfig,
        echo_config: EchoConfig,
        noise_config: NoiseConfig,
        primary: Box<dyn AudioBackend>,
        secondary: Option<Box<dyn AudioBackend>>,
        bus: Option<Arc<PlaybackReferenceBus>>,
    ) -> Self {
        let sample_rate = primary.format().sample_rate;
        let echo_cancellation = config.echo_cancellation && bus.is_some();
        if config.echo_cancellation && bus.is_none() {
            debug!("Echo cancellation requested without a playback reference, disabled");
        }
        let echo = echo_cancellation.then(|| EchoCanceller::new(sample_rate, &echo_config));
        let noise = config.noise_reduction.then(|| NoiseReducer::new(&noise_config));
        let dual_mic = config.dual_mic && secondary.is_some();
        AudioCapture {
            pipeline: Arc::new(Mutex::new(Pipeline {
                primary,
                secondary,
                echo,
                noise,
            })),
            bus,
            frames: Arc::new(DropOldestQueue::new()),
            observers: Arc::new(ObserverList::new()),
            sample_rate: Arc::new(AtomicU32::new(sample_rate)),
            recording: Arc::new(AtomicBool::new(false)),
            dual_mic: AtomicBool::new(dual_mic),
            noise_reduction: config.noise_reduction,
            dual_mic_requested: config.dual_mic,
            echo_cancellation,
            run: Mutex::new(None),
        }
    }

    pub fn start(&self) -> MonitorResult<()> {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.is_some() && self.is_recording() {
            debug!("Audio capture already running");
            return Ok(());
        }
        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            previous.worker.join_timeout(STOP_TIMEOUT);
        }

        let mut pipeline = match self.pipeline.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(MonitorError::Device("previous capture thread still owns the device".to_string()));
            }
        };
        pipeline.primary.start()?;
        let format = pipeline.primary.format();
        let name = pipeline.primary.name();

        let dual_mic = match (&mut pipeline.secondary, self.dual_mic_requested && self.noise_reduction) {
            (Some(second), true) => match second.start() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Second microphone unavailable, dual mic disabled: {}", e);
                    false
                }
            },
            (None, true) => {
                warn!("Dual mic enabled but no second microphone configured");
                false
            }
            _ => false,
        };
        if let Some(noise) = &mut pipeline.noise {
            noise.restart_estimation();
        }
        drop(pipeline);

        self.sample_rate.store(format.sample_rate, Ordering::SeqCst);
        self.dual_mic.store(dual_mic, Ordering::SeqCst);
        self.frames.clear();
        self.recording.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let capture_loop = CaptureLoop {
            pipeline: self.pipeline.clone(),
            bus: if self.echo_cancellation { self.bus.clone() } else { None },
            frames: self.frames.clone(),
            observers: self.observers.clone(),
            recording: self.recording.clone(),
            cancel: cancel.clone(),
            channels: format.channels as usize,
            sample_rate: format.sample_rate,
            dual_mic,
        };
        let worker = match Worker::spawn("audio-capture", move || capture_loop.run()) {
            Ok(w) => w,
            Err(e) => {
                self.recording.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *run = Some(Running { cancel, worker });
        info!(
            "Audio capture started on {} ({} Hz, {} ch, nr={}, dual={}, aec={})",
            name, format.sample_rate, format.channels, self.noise_reduction, dual_mic, self.echo_cancellation
        );
        Ok(())
    }

    pub fn stop(&self) {
        let running = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(running) = running {
            running.cancel.cancel();
            if !running.worker.join_timeout(STOP_TIMEOUT) {
                warn!("Audio capture thread did not stop in time");
            }
            info!("Audio capture stopped");
        }
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn noise_reduction_enabled(&self) -> bool {
        self.noise_reduction
    }

    pub fn dual_mic_enabled(&self) -> bool {
        self.dual_mic.load(Ordering::SeqCst)
    }

    pub fn echo_cancellation_enabled(&self) -> bool {
        self.echo_cancellation
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    pub fn get_audio(&self, timeout: Duration) -> Option<AudioFrame> {
        self.frames.pop_timeout(timeout)
    }

    pub fn get_buffer(&self, duration: Duration) -> Vec<i16> {
        let wanted = (duration.as_secs_f64() * self.sample_rate() as f64) as usize;
        let mut samples = Vec::with_capacity(wanted);
        while samples.len() < wanted {
            match self.frames.pop_timeout(CHUNK_TIMEOUT) {
                Some(frame) => samples.extend(frame.into_samples()),
                None => break,
            }
        }
        samples.truncate(wanted);
        samples
    }

    pub fn record_to_file(&self, path: &Path, duration: Duration) -> MonitorResult<PathBuf> {
        info!("Recording {:?} of audio to {:?}", duration, path);
        let samples = self.get_buffer(duration);
        if samples.is_empty() {
            return Err(MonitorError::Device("no audio captured for recording".to_string()));
        }
        save_wav(&samples, self.sample_rate(), path)
    }

    pub fn add_observer(&self, observer: Arc<dyn FrameObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Frames evicted from the output queue because nobody read them in time.
    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }
}

impl AudioSource for AudioCapture {
    fn sample_rate(&self) -> u32 {
        AudioCapture::sample_rate(self)
    }

    fn get_buffer(&self, duration: Duration) -> Vec<i16> {
        AudioCapture::get_buffer(self, duration)
    }

    fn record_clip(&self, duration: Duration, path: &Path) -> MonitorResult<PathBuf> {
        self.record_to_file(path, duration)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    pipeline: Arc<Mutex<Pipeline>>,
    bus: Option<Arc<PlaybackReferenceBus>>,
    frames: Arc<DropOldestQueue<AudioFrame>>,
    observers: Arc<ObserverList<dyn FrameObserver>>,
    recording: Arc<AtomicBool>,
    cancel: CancellationToken,
    channels: usize,
    sample_rate: u32,
    dual_mic: bool,
}

impl CaptureLoop {
    fn run(self) {
        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.cancel.is_cancelled() {
            let block = match pipeline.primary.read() {
                Ok(block) => block,
                Err(e) => {
                    warn!("Audio read error: {}", e);
                    sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            };
            if block.is_empty() {
                continue;
            }
            let mono = downmix(&bytes_to_samples(&block), self.channels);
            let second_mic = if self.dual_mic { read_second_mic(&mut pipeline) } else { None };
            let reference = match (&self.bus, pipeline.echo.is_some()) {
                (Some(bus), true) => bus.try_take(),
                _ => None,
            };

            let processed = pipeline.process(mono, second_mic.as_deref(), reference);
            let frame = AudioFrame::new(processed, self.sample_rate);
            if self.frames.push(frame.clone()) {
                trace!("Capture queue full, dropped oldest frame");
            }
            self.observers.notify(|o| o.on_frame(&frame));
        }

        if let Err(e) = pipeline.primary.stop() {
            warn!("Error stopping {}: {}", pipeline.primary.name(), e);
        }
        if self.dual_mic {
            if let Some(second) = &mut pipeline.secondary {
                if let Err(e) = second.stop() {
                    warn!("Error stopping second microphone: {}", e);
                }
            }
        }
        self.recording.store(false, Ordering::SeqCst);
        debug!("Capture loop finished");
    }
}

fn read_second_mic(pipeline: &mut Pipeline) -> Option<Vec<i16>> {
    let second = pipeline.secondary.as_mut()?;
    let channels = second.format().channels as usize;
    match second.read() {
        Ok(block) if !block.is_empty() => Some(downmix(&bytes_to_samples(&block), channels)),
        Ok(_) => None,
        Err(e) => {
            debug!("Second microphone read error: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryBackend, MemoryHandle, PcmFormat};
    use crate::dsp::signals::{noise, to_i16};
    use crate::rms::mean_magnitude;
    use crate::save::load_wav;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::tempdir;

    const RATE: u32 = 16_000;
    const BLOCK: usize = 160;

    fn plain_config() -> AudioConfig {
        AudioConfig {
            sample_rate: RATE,
            channels: 1,
            block_size: BLOCK,
            noise_reduction: false,
            dual_mic: false,
            echo_cancellation: false,
        }
    }

    fn capture_with(config: AudioConfig, channels: u16, bus: Option<Arc<PlaybackReferenceBus>>) -> (AudioCapture, MemoryHandle) {
        let (backend, handle) = MemoryBackend::new(PcmFormat::new(RATE, channels, BLOCK));
        let capture = AudioCapture::new(config, EchoConfig::default(), NoiseConfig::default(), Box::new(backend), None, bus);
        (capture, handle)
    }

    #[test]
    fn start_stop_lifecycle() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        assert!(!capture.is_recording());
        capture.start().unwrap();
        capture.start().unwrap();
        assert!(capture.is_recording());
        assert!(handle.is_started());
        capture.stop();
        assert!(!capture.is_recording());
        assert!(!handle.is_started());
        capture.stop();
        capture.start().unwrap();
        assert!(capture.is_recording());
    }

    #[test]
    fn start_failure_is_reported() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        handle.fail_start(true);
        assert!(matches!(capture.start(), Err(MonitorError::Device(_))));
        assert!(!capture.is_recording());
    }

    #[test]
    fn buffer_is_cut_to_duration() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        capture.start().unwrap();
        for i in 0..20 {
            handle.push_samples(&vec![i as i16; BLOCK]);
        }
        let buffer = capture.get_buffer(Duration::from_millis(100));
        assert_eq!(buffer.len(), 1600);
        assert_eq!(buffer[0], 0);
        assert_eq!(buffer[1599], 9);
    }

    #[test]
    fn short_buffer_after_timeout() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        capture.start().unwrap();
        for _ in 0..3 {
            handle.push_samples(&[7; BLOCK]);
        }
        let started = Instant::now();
        let buffer = capture.get_buffer(Duration::from_secs(1));
        assert_eq!(buffer.len(), 3 * BLOCK);
        assert!(started.elapsed() >= CHUNK_TIMEOUT);
    }

    #[test]
    fn stereo_is_downmixed() {
        let (capture, handle) = capture_with(plain_config(), 2, None);
        capture.start().unwrap();
        let interleaved: Vec<i16> = (0..BLOCK).flat_map(|_| [100i16, 300]).collect();
        handle.push_samples(&interleaved);
        let frame = capture.get_audio(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.len(), BLOCK);
        assert!(frame.samples().iter().all(|s| *s == 200));
    }

    #[test]
    fn read_errors_do_not_stop_capture() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        capture.start().unwrap();
        handle.fail_next_reads(3);
        handle.push_samples(&[1; BLOCK]);
        assert!(capture.get_audio(Duration::from_secs(2)).is_some());
        assert!(capture.is_recording());
    }

    #[test]
    fn observers_see_frames_despite_panics() {
        let (capture, handle) = capture_with(plain_config(), 1, None);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        capture.add_observer(Arc::new(|_: &AudioFrame| panic!("bad observer")));
        let id = capture.add_observer(Arc::new(move |_: &AudioFrame| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        capture.start().unwrap();
        for _ in 0..2 {
            handle.push_samples(&[1; BLOCK]);
            capture.get_audio(Duration::from_secs(1)).unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(capture.remove_observer(id));
        assert!(capture.is_recording());
    }

    #[test]
    fn echo_of_playback_is_removed() {
        let bus = Arc::new(PlaybackReferenceBus::new());
        let config = AudioConfig {
            echo_cancellation: true,
            ..plain_config()
        };
        let (backend, handle) = MemoryBackend::new(PcmFormat::mono(RATE, BLOCK));
        let echo = EchoConfig {
            tail_secs: 16.0 / RATE as f32,
            step_size: 0.01,
        };
        let capture = AudioCapture::new(config, echo, NoiseConfig::default(), Box::new(backend), None, Some(bus.clone()));
        assert!(capture.echo_cancellation_enabled());
        capture.start().unwrap();

        let played = to_i16(&noise(BLOCK * 60, 16_000.0, 21));
        for block in played.chunks(BLOCK) {
            bus.publish(block);
            handle.push_samples(&block.iter().map(|s| s / 2).collect::<Vec<i16>>());
        }
        let frames: Vec<AudioFrame> = (0..60).filter_map(|_| capture.get_audio(Duration::from_secs(1))).collect();
        assert_eq!(frames.len(), 60);
        assert!(mean_magnitude(frames[59].samples()) < mean_magnitude(frames[0].samples()) * 0.2);
    }

    #[test]
    fn echo_needs_a_bus() {
        let config = AudioConfig {
            echo_cancellation: true,
            ..plain_config()
        };
        let (capture, _handle) = capture_with(config, 1, None);
        assert!(!capture.echo_cancellation_enabled());
    }

    #[test]
    fn dual_mic_without_second_device_is_disabled() {
        let config = AudioConfig {
            dual_mic: true,
            noise_reduction: true,
            ..plain_config()
        };
        let (capture, _handle) = capture_with(config, 1, None);
        capture.start().unwrap();
        assert!(!capture.dual_mic_enabled());
        assert!(capture.noise_reduction_enabled());
    }

    #[test]
    fn dual_mic_with_second_device() {
        let config = AudioConfig {
            dual_mic: true,
            noise_reduction: true,
            ..plain_config()
        };
        let (primary, handle) = MemoryBackend::new(PcmFormat::mono(RATE, BLOCK));
        let (secondary, second_handle) = MemoryBackend::new(PcmFormat::mono(RATE, BLOCK));
        let capture = AudioCapture::new(
            config,
            EchoConfig::default(),
            NoiseConfig::default(),
            Box::new(primary),
            Some(Box::new(secondary)),
            None,
        );
        capture.start().unwrap();
        assert!(capture.dual_mic_enabled());
        assert!(second_handle.is_started());
        second_handle.push_samples(&[5; BLOCK]);
        handle.push_samples(&[5; BLOCK]);
        assert_eq!(capture.get_audio(Duration::from_secs(1)).unwrap().len(), BLOCK);
    }

    #[test]
    fn records_clip_to_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let (capture, handle) = capture_with(plain_config(), 1, None);
        capture.start().unwrap();
        for _ in 0..10 {
            handle.push_samples(&[42; BLOCK]);
        }
        let saved = capture.record_clip(Duration::from_millis(50), &path).unwrap();
        let wav = load_wav(&saved).unwrap();
        assert_eq!(wav.samples, vec![42; 800]);
        assert_eq!(wav.sample_rate, RATE);
    }

    #[test]
    fn empty_recording_is_an_error() {
        let dir = tempdir().unwrap();
        let (capture, _handle) = capture_with(plain_config(), 1, None);
        capture.start().unwrap();
        assert!(capture.record_to_file(&dir.path().join("none.wav"), Duration::from_millis(10)).is_err());
    }
}
