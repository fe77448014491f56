use crate::config::AudioConfig;
use crate::error::{MonitorError, MonitorResult};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cpal")]
pub mod cpal_backend;
#[cfg(feature = "cpal")]
pub mod cpal_config;
pub mod memory;
#[cfg(feature = "pv-recorder")]
pub mod pv;
#[cfg(any(feature = "pv-recorder", feature = "cpal", test))]
mod stream_thread;
pub mod wav_file;

pub use memory::{MemoryBackend, MemoryHandle};
pub use wav_file::WavFileBackend;

/// Negotiated PCM layout: interleaved little-endian i16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_size: usize,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, block_size: usize) -> Self {
        PcmFormat { sample_rate, channels, block_size }
    }

    pub fn mono(sample_rate: u32, block_size: usize) -> Self {
        PcmFormat::new(sample_rate, 1, block_size)
    }

    pub fn block_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }

    pub fn block_bytes(&self) -> usize {
        self.block_size * self.channels as usize * 2
    }
}

impl From<&AudioConfig> for PcmFormat {
    fn from(config: &AudioConfig) -> Self {
        PcmFormat::new(config.sample_rate, config.channels, config.block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Capture,
    Playback,
}

/// Hardware audio boundary. `read` returns one block of raw PCM; an empty block means nothing
/// arrived in time and is not an error.
pub trait AudioBackend: Send {
    fn name(&self) -> String;

    /// Format actually in use; may differ from the requested one after `start`.
    fn format(&self) -> PcmFormat;

    fn start(&mut self) -> MonitorResult<()>;

    fn stop(&mut self) -> MonitorResult<()>;

    fn read(&mut self) -> MonitorResult<Vec<u8>>;

    fn write(&mut self, pcm: &[u8]) -> MonitorResult<()>;
}

/// Concrete backends, picked once at construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendKind {
    PvRecorder { device_index: i32 },
    Cpal,
    WavFile { path: PathBuf, looping: bool },
}

pub fn open_backend(kind: &BackendKind, format: PcmFormat, direction: StreamDirection) -> MonitorResult<Box<dyn AudioBackend>> {
    match kind {
        #[cfg(feature = "pv-recorder")]
        BackendKind::PvRecorder { device_index } => {
            if direction == StreamDirection::Playback {
                return Err(MonitorError::Unsupported("pv_recorder cannot play audio".to_string()));
            }
            Ok(Box::new(pv::PvRecorderBackend::new(*device_index, format)))
        }
        #[cfg(feature = "cpal")]
        BackendKind::Cpal => Ok(Box::new(cpal_backend::CpalBackend::new(format, direction))),
        BackendKind::WavFile { path, looping } => {
            if direction == StreamDirection::Playback {
                return Err(MonitorError::Unsupported("WAV file backend is capture only".to_string()));
            }
            Ok(Box::new(WavFileBackend::open(path, format.block_size, *looping)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(MonitorError::Unsupported(format!("{:?} backend not compiled in", other))),
    }
}

pub fn list_capture_devices(kind: &BackendKind) -> MonitorResult<Vec<String>> {
    match kind {
        #[cfg(feature = "pv-recorder")]
        BackendKind::PvRecorder { .. } => pv::available_devices(),
        #[cfg(feature = "cpal")]
        BackendKind::Cpal => cpal_backend::available_input_devices(),
        BackendKind::WavFile { path, .. } => Ok(vec![path.display().to_string()]),
        #[allow(unreachable_patterns)]
        other => Err(MonitorError::Unsupported(format!("{:?} backend not compiled in", other))),
    }
}
