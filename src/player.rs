use crate::converters::{downmix, samples_to_bytes};
use crate::device::AudioBackend;
use crate::error::{MonitorError, MonitorResult};
use crate::reference_bus::PlaybackReferenceBus;
use crate::save::load_wav;
use crate::worker::Worker;
use log::{debug, error, info};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PLAYBACK_CHUNK: usize = 1024;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What the alarm path needs from a speaker. Both calls return once playback has been started.
pub trait AlarmSound: Send + Sync {
    fn play_alarm_file(&self, path: &Path) -> MonitorResult<()>;

    fn play_alarm_tone(&self, frequency_hz: f32, duration: Duration, volume: f32) -> MonitorResult<()>;

    /// Whether an earlier sound is still going.
    fn is_busy(&self) -> bool {
        false
    }
}

/// Sine tone, `volume` in 0..=1, sampled like `linspace(0, duration, n)`.
pub fn synthesize_tone(frequency_hz: f32, duration: Duration, volume: f32, sample_rate: u32) -> Vec<i16> {
    let n = (sample_rate as f64 * duration.as_secs_f64()) as usize;
    if n == 0 {
        return vec![];
    }
    let step = if n > 1 { duration.as_secs_f32() / (n - 1) as f32 } else { 0.0 };
    let volume = volume.clamp(0.0, 1.0);
    (0..n)
        .map(|i| ((2.0 * PI * frequency_hz * i as f32 * step).sin() * volume * 32767.0) as i16)
        .collect()
}

struct Output {
    backend: Box<dyn AudioBackend>,
    started: bool,
}

struct Playback {
    cancel: CancellationToken,
    worker: Option<Worker>,
}

/// Speaker output. Every written chunk is also published to the reference bus so the
/// capture side can cancel it. One playback at a time; a new one stops the previous.
pub struct AudioPlayer {
    output: Arc<Mutex<Output>>,
    sample_rate: u32,
    bus: Option<Arc<PlaybackReferenceBus>>,
    playing: Arc<AtomicBool>,
    current: Mutex<Option<Playback>>,
}

impl AudioPlayer {
    pub fn new(backend: Box<dyn AudioBackend>, sample_rate: u32, bus: Option<Arc<PlaybackReferenceBus>>) -> Self {
        AudioPlayer {
            output: Arc::new(Mutex::new(Output { backend, started: false })),
            sample_rate,
            bus,
            playing: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Plays mono samples at the player's rate.
    pub fn play_data(&self, samples: Vec<i16>, blocking: bool) -> MonitorResult<()> {
        self.stop();
        let cancel = CancellationToken::new();
        let job = PlaybackJob {
            output: self.output.clone(),
            bus: self.bus.clone(),
            playing: self.playing.clone(),
            cancel: cancel.clone(),
            samples,
        };
        self.playing.store(true, Ordering::SeqCst);
        if blocking {
            *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Playback { cancel, worker: None });
            return job.run();
        }
        let worker = Worker::spawn("audio-playback", move || {
            if let Err(e) = job.run() {
                error!("Playback error: {}", e);
            }
        });
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                self.playing.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Playback {
            cancel,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Plays a WAV file, downmixed to mono. The file must match the player's sample rate.
    pub fn play_file(&self, path: &Path, blocking: bool) -> MonitorResult<()> {
        if !path.exists() {
            return Err(MonitorError::Playback(format!("Audio file not found: {}", path.display())));
        }
        let wav = load_wav(path)?;
        if wav.sample_rate != self.sample_rate {
            return Err(MonitorError::Playback(format!(
                "{} is {} Hz, player runs at {} Hz",
                path.display(),
                wav.sample_rate,
                self.sample_rate
            )));
        }
        info!("Playing WAV: {}", path.display());
        self.play_data(downmix(&wav.samples, wav.channels as usize), blocking)
    }

    pub fn play_tone(&self, frequency_hz: f32, duration: Duration, volume: f32) -> MonitorResult<()> {
        debug!("Tone {} Hz for {:?}", frequency_hz, duration);
        self.play_data(synthesize_tone(frequency_hz, duration, volume, self.sample_rate), false)
    }

    /// Waits for a background playback to finish on its own.
    pub fn wait(&self, timeout: Duration) -> bool {
        let worker = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|p| p.worker.take());
        match worker {
            Some(worker) => worker.join_timeout(timeout),
            None => true,
        }
    }

    pub fn stop(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(playback) = current {
            playback.cancel.cancel();
            if let Some(worker) = playback.worker {
                worker.join_timeout(STOP_TIMEOUT);
            }
            debug!("Stopped playback");
        }
        self.playing.store(false, Ordering::SeqCst);
    }
}

impl AlarmSound for AudioPlayer {
    fn play_alarm_file(&self, path: &Path) -> MonitorResult<()> {
        self.play_file(path, false)
    }

    fn play_alarm_tone(&self, frequency_hz: f32, duration: Duration, volume: f32) -> MonitorResult<()> {
        self.play_tone(frequency_hz, duration, volume)
    }

    fn is_busy(&self) -> bool {
        self.is_playing()
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if output.started {
            if let Err(e) = output.backend.stop() {
                debug!("Error closing playback device: {}", e);
            }
            output.started = false;
        }
    }
}

struct PlaybackJob {
    output: Arc<Mutex<Output>>,
    bus: Option<Arc<PlaybackReferenceBus>>,
    playing: Arc<AtomicBool>,
    cancel: CancellationToken,
    samples: Vec<i16>,
}

impl PlaybackJob {
    fn run(self) -> MonitorResult<()> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.write_all(&mut output);
        self.playing.store(false, Ordering::SeqCst);
        result
    }

    fn write_all(&self, output: &mut Output) -> MonitorResult<()> {
        if !output.started {
            output.backend.start()?;
            output.started = true;
        }
        let channels = output.backend.format().channels.max(1) as usize;
        for chunk in self.samples.chunks(PLAYBACK_CHUNK) {
            if self.cancel.is_cancelled() {
                debug!("Playback cancelled");
                break;
            }
            let pcm = if channels > 1 {
                chunk.iter().flat_map(|s| std::iter::repeat(*s).take(channels)).collect::<Vec<i16>>()
            } else {
                chunk.to_vec()
            };
            output.backend.write(&samples_to_bytes(&pcm))?;
            if let Some(bus) = &self.bus {
                bus.publish(chunk);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryBackend, MemoryHandle, PcmFormat};
    use crate::save::save_wav;
    use std::thread::sleep;
    use tempfile::tempdir;

    const RATE: u32 = 16_000;

    fn player(channels: u16, bus: Option<Arc<PlaybackReferenceBus>>) -> (AudioPlayer, MemoryHandle) {
        let (backend, handle) = MemoryBackend::new(PcmFormat::new(RATE, channels, PLAYBACK_CHUNK));
        (AudioPlayer::new(Box::new(backend), RATE, bus), handle)
    }

    #[test]
    fn tone_shape() {
        let tone = synthesize_tone(800.0, Duration::from_millis(500), 0.5, RATE);
        assert_eq!(tone.len(), 8000);
        assert_eq!(tone[0], 0);
        let peak = tone.iter().map(|s| s.abs()).max().unwrap();
        assert!(peak > 16_000 && peak <= 16_384);
        assert!(synthesize_tone(800.0, Duration::ZERO, 0.5, RATE).is_empty());
    }

    #[test]
    fn blocking_play_writes_and_publishes_chunks() {
        let bus = Arc::new(PlaybackReferenceBus::new());
        let (player, handle) = player(1, Some(bus.clone()));
        let samples: Vec<i16> = (0..2500).map(|i| i as i16).collect();
        player.play_data(samples.clone(), true).unwrap();
        assert!(!player.is_playing());
        assert_eq!(handle.written_samples(), samples);
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.try_take().unwrap().len(), PLAYBACK_CHUNK);
    }

    #[test]
    fn stereo_output_duplicates_channels() {
        let (player, handle) = player(2, None);
        player.play_data(vec![1, 2], true).unwrap();
        assert_eq!(handle.written_samples(), vec![1, 1, 2, 2]);
    }

    #[test]
    fn background_playback_finishes() {
        let (player, handle) = player(1, None);
        player.play_data(vec![3; 3000], false).unwrap();
        assert!(player.wait(Duration::from_secs(2)));
        assert!(!player.is_playing());
        assert_eq!(handle.written_samples().len(), 3000);
    }

    #[test]
    fn stop_interrupts_playback() {
        let (player, handle) = player(1, None);
        handle.pace_writes(true);
        player.play_data(vec![1; RATE as usize], false).unwrap();
        sleep(Duration::from_millis(100));
        assert!(player.is_playing());
        player.stop();
        assert!(!player.is_playing());
        assert!(handle.written_samples().len() < RATE as usize);
    }

    #[test]
    fn new_playback_replaces_previous() {
        let (player, handle) = player(1, None);
        handle.pace_writes(true);
        player.play_data(vec![1; RATE as usize], false).unwrap();
        sleep(Duration::from_millis(100));
        player.play_data(vec![2; 100], true).unwrap();
        let written = handle.written_samples();
        assert!(written.len() < RATE as usize + 100);
        assert_eq!(&written[written.len() - 100..], &[2; 100][..]);
    }

    #[test]
    fn play_file_downmixes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [100i16, 300, -100, -300] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let (player, handle) = player(1, None);
        player.play_file(&path, true).unwrap();
        assert_eq!(handle.written_samples(), vec![200, -200]);
    }

    #[test]
    fn play_file_errors() {
        let dir = tempdir().unwrap();
        let (player, _handle) = player(1, None);
        assert!(matches!(
            player.play_file(&dir.path().join("missing.wav"), true),
            Err(MonitorError::Playback(_))
        ));
        let other_rate = dir.path().join("8k.wav");
        save_wav(&[0; 10], 8_000, &other_rate).unwrap();
        assert!(matches!(player.play_file(&other_rate, true), Err(MonitorError::Playback(_))));
    }

    #[test]
    fn alarm_tone_plays_in_background() {
        let (player, handle) = player(1, None);
        player.play_alarm_tone(800.0, Duration::from_millis(100), 0.5).unwrap();
        assert!(player.wait(Duration::from_secs(2)));
        assert_eq!(handle.written_samples().len(), 1600);
    }
}
