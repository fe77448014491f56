use std::time::Duration;

/// Mono block of processed capture audio. Ownership moves from stage to stage; nothing mutates it in place.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        AudioFrame { samples, sample_rate }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Copy of audio that was just written to the output device, kept only for echo prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceFrame {
    samples: Vec<i16>,
}

impl ReferenceFrame {
    pub fn from_played(played: &[i16]) -> Self {
        ReferenceFrame { samples: played.to_vec() }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
