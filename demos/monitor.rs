use crywatch::classifier::{SoundCategory, SoundClassifier, SoundEvent};
use crywatch::device::{open_backend, BackendKind, PcmFormat, StreamDirection};
use crywatch::player::PLAYBACK_CHUNK;
use crywatch::rms::calculate_rms;
use crywatch::{CryMonitor, MonitorConfig, MonitorResult};
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

const LOUD_LEVEL: i16 = 2_000;
const RUN_FOR: Duration = Duration::from_secs(60);

/// Stand-in for a real sound model: anything loud counts as crying.
struct LevelClassifier;

impl SoundClassifier for LevelClassifier {
    fn load(&mut self) -> MonitorResult<()> {
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn classify(&mut self, samples: &[i16]) -> MonitorResult<SoundEvent> {
        let level = calculate_rms(samples);
        if level > LOUD_LEVEL {
            Ok(SoundEvent::new(SoundCategory::Crying, 0.9, format!("loud ({})", level)))
        } else {
            Ok(SoundEvent::new(SoundCategory::Silence, 0.9, format!("quiet ({})", level)))
        }
    }
}

/// Watches a WAV file given as the first argument, or the default microphone.
fn main() -> MonitorResult<()> {
    Builder::new().filter_level(LevelFilter::Info).init();

    let mut config = MonitorConfig::default();
    config.audio.sample_rate = 16_000;
    config.audio.channels = 1;
    config.audio.block_size = 512;
    let capture = match env::args().nth(1) {
        Some(path) => BackendKind::WavFile {
            path: PathBuf::from(path),
            looping: true,
        },
        None => BackendKind::PvRecorder { device_index: -1 },
    };
    config.alarm.cooldown_duration_secs = 10.0;

    let input = open_backend(&capture, PcmFormat::from(&config.audio), StreamDirection::Capture)?;
    let playback_format = PcmFormat::new(config.audio.sample_rate, 1, PLAYBACK_CHUNK);
    let output = match open_backend(&BackendKind::Cpal, playback_format, StreamDirection::Playback) {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!("Running without a speaker: {}", e);
            None
        }
    };

    let monitor = CryMonitor::new(config, input, None, output, Box::new(LevelClassifier))?;
    let mut events = monitor.subscribe();
    monitor.start()?;
    info!("Listening for {:?}", RUN_FOR);

    let started = Instant::now();
    while started.elapsed() < RUN_FOR {
        match events.try_recv() {
            Ok(event) => info!(
                "{:?} confidence {:.2} after {:.1}s {:?}",
                event.event_type, event.confidence, event.duration, event.audio_file
            ),
            Err(TryRecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(100)),
            Err(TryRecvError::Closed) => break,
        }
    }
    monitor.stop();
    Ok(())
}
