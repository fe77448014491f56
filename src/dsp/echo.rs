use crate::config::EchoConfig;
use crate::converters::{f32_to_i16, i16_to_f32};
use crate::dsp::lms::LmsFilter;
use log::debug;

/// Removes the robot's own speaker output from the microphone signal.
pub struct EchoCanceller {
    filter: LmsFilter,
}

impl EchoCanceller {
    pub fn new(sample_rate: u32, config: &EchoConfig) -> Self {
        let taps = (config.tail_secs * sample_rate as f32) as usize;
        debug!("Echo canceller with {} taps, step {}", taps.max(1), config.step_size);
        EchoCanceller {
            filter: LmsFilter::new(taps, config.step_size),
        }
    }

    pub fn taps(&self) -> usize {
        self.filter.taps()
    }

    pub fn weights(&self) -> &[f32] {
        self.filter.weights()
    }

    /// Without a reference (nothing playing) the frame passes through untouched. Otherwise both
    /// signals are cut to the shorter length before filtering.
    pub fn cancel(&mut self, primary: &[i16], reference: Option<&[i16]>) -> Vec<i16> {
        let reference = match reference {
            Some(r) if !r.is_empty() => r,
            _ => return primary.to_vec(),
        };
        let len = primary.len().min(reference.len());
        let primary_f: Vec<f32> = primary[..len].iter().map(i16_to_f32).collect();
        let reference_f: Vec<f32> = reference[..len].iter().map(i16_to_f32).collect();
        self.filter.process(&primary_f, &reference_f).iter().map(f32_to_i16).collect()
    }
}
