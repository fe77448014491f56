use crate::converters::samples_to_bytes;
use crate::device::{AudioBackend, PcmFormat};
use crate::error::{MonitorError, MonitorResult};
use crate::save::load_wav;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Replays a WAV file as if it were a microphone, paced in real time.
pub struct WavFileBackend {
    path: PathBuf,
    samples: Vec<i16>,
    format: PcmFormat,
    position: usize,
    looping: bool,
    started: bool,
    next_block_at: Option<Instant>,
    realtime: bool,
}

impl WavFileBackend {
    pub fn open(path: &Path, block_size: usize, looping: bool) -> MonitorResult<Self> {
        let wav = load_wav(path)?;
        if wav.channels == 0 || block_size == 0 {
            return Err(MonitorError::Config(format!("Unusable WAV layout in {:?}", path)));
        }
        info!("WAV source {:?}: {} Hz, {} channels, {} samples", path, wav.sample_rate, wav.channels, wav.samples.len());
        Ok(WavFileBackend {
            path: path.to_path_buf(),
            samples: wav.samples,
            format: PcmFormat::new(wav.sample_rate, wav.channels, block_size),
            position: 0,
            looping,
            started: false,
            next_block_at: None,
            realtime: true,
        })
    }

    /// Hands out blocks as fast as they are asked for.
    pub fn without_pacing(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn is_exhausted(&self) -> bool {
        !self.looping && self.position >= self.samples.len()
    }

    fn pace(&mut self) {
        if !self.realtime {
            return;
        }
        let block = self.format.block_duration();
        let now = Instant::now();
        let due = *self.next_block_at.get_or_insert(now);
        if due > now {
            sleep(due - now);
        }
        // fall back to "now" when the reader lags so we never burst to catch up
        self.next_block_at = Some(due.max(now) + block);
    }
}

impl AudioBackend for WavFileBackend {
    fn name(&self) -> String {
        format!("wav:{}", self.path.display())
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self) -> MonitorResult<()> {
        self.started = true;
        self.next_block_at = None;
        Ok(())
    }

    fn stop(&mut self) -> MonitorResult<()> {
        self.started = false;
        Ok(())
    }

    fn read(&mut self) -> MonitorResult<Vec<u8>> {
        if !self.started {
            return Err(MonitorError::Device(format!("{} not started", self.name())));
        }
        self.pace();
        if self.position >= self.samples.len() {
            if !self.looping || self.samples.is_empty() {
                return Ok(vec![]);
            }
            debug!("Rewinding {:?}", self.path);
            self.position = 0;
        }
        let wanted = self.format.block_size * self.format.channels as usize;
        let end = (self.position + wanted).min(self.samples.len());
        let block = samples_to_bytes(&self.samples[self.position..end]);
        self.position = end;
        Ok(block)
    }

    fn write(&mut self, _pcm: &[u8]) -> MonitorResult<()> {
        Err(MonitorError::Unsupported("WAV file backend is capture only".to_string()))
    }
}
