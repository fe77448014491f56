use crate::config::NoiseConfig;
use crate::converters::{f32_to_i16, i16_to_f32};
use crate::dsp::lms::LmsFilter;
use crate::rms::mean_energy;
use log::{debug, trace};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f32::consts::PI;

/// Spectral-subtraction noise reducer with an optional dual-microphone LMS stage.
///
/// The noise floor is learned from non-speech frames, at most `seed_frames` of them per
/// (re)start, and once it exists it is only ever blended. The state is owned by one thread.
pub struct NoiseReducer {
    config: NoiseConfig,
    planner: FftPlanner<f32>,
    window: Vec<f32>,
    noise_floor: Option<Vec<f32>>,
    estimate_frames: u32,
    dual_mic: LmsFilter,
}

impl NoiseReducer {
    pub fn new(config: &NoiseConfig) -> Self {
        NoiseReducer {
            config: config.clone(),
            planner: FftPlanner::new(),
            window: vec![],
            noise_floor: None,
            estimate_frames: 0,
            dual_mic: LmsFilter::new(config.dual_mic_taps, config.dual_mic_step_size),
        }
    }

    pub fn has_noise_floor(&self) -> bool {
        self.noise_floor.is_some()
    }

    pub fn noise_floor(&self) -> Option<&[f32]> {
        self.noise_floor.as_deref()
    }

    /// Allows another `seed_frames` silent frames to refine the floor; the floor itself is kept.
    pub fn restart_estimation(&mut self) {
        self.estimate_frames = 0;
    }

    pub fn reduce(&mut self, frame: &[i16], second_mic: Option<&[i16]>) -> Vec<i16> {
        match second_mic {
            Some(second) if second.len() == frame.len() && !frame.is_empty() => {
                let cancelled = self.cancel_correlated(frame, second);
                self.spectral_subtraction(&cancelled)
            }
            _ => self.spectral_subtraction(frame),
        }
    }

    fn cancel_correlated(&mut self, primary: &[i16], second: &[i16]) -> Vec<i16> {
        let primary_f: Vec<f32> = primary.iter().map(i16_to_f32).collect();
        let second_f: Vec<f32> = second.iter().map(i16_to_f32).collect();
        self.dual_mic.process(&primary_f, &second_f).iter().map(f32_to_i16).collect()
    }

    fn spectral_subtraction(&mut self, audio: &[i16]) -> Vec<i16> {
        let len = audio.len();
        if len == 0 {
            return vec![];
        }
        let bins = len / 2 + 1;
        if let Some(floor) = &self.noise_floor {
            if floor.len() != bins {
                trace!("Frame of {} samples does not match noise floor of {} bins", len, floor.len());
                return audio.to_vec();
            }
        }
        if self.window.len() != len {
            self.window = hann_window(len);
        }

        let mut spectrum: Vec<Complex<f32>> = audio
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| Complex::new(s as f32 * w, 0.0))
            .collect();
        self.planner.plan_fft_forward(len).process(&mut spectrum);
        let magnitude: Vec<f32> = spectrum[..bins].iter().map(|c| c.norm()).collect();

        let normalised: Vec<f32> = audio.iter().map(i16_to_f32).collect();
        let is_speech = mean_energy(&normalised) > self.config.vad_threshold;
        if !is_speech && self.estimate_frames < self.config.seed_frames {
            self.update_noise_floor(&magnitude);
            self.estimate_frames += 1;
        }

        let floor = match &self.noise_floor {
            Some(floor) => floor,
            None => return audio.to_vec(),
        };

        for (k, (bin, &m)) in spectrum[..bins].iter_mut().zip(&magnitude).enumerate() {
            let cleaned = (m - self.config.subtraction_factor * floor[k]).max(self.config.spectral_floor * m);
            // rescaling the complex bin keeps the original phase
            *bin = if m > 0.0 { *bin * (cleaned / m) } else { Complex::new(0.0, 0.0) };
        }
        for k in 1..bins {
            if len - k >= bins {
                spectrum[len - k] = spectrum[k].conj();
            }
        }

        self.planner.plan_fft_inverse(len).process(&mut spectrum);
        let scale = 1.0 / len as f32;
        spectrum.iter().map(|c| (c.re * scale).clamp(-32768.0, 32767.0) as i16).collect()
    }

    fn update_noise_floor(&mut self, magnitude: &[f32]) {
        let alpha = self.config.smoothing;
        match &mut self.noise_floor {
            Some(floor) => {
                for (f, &m) in floor.iter_mut().zip(magnitude) {
                    *f = alpha * *f + (1.0 - alpha) * m;
                }
            }
            None => {
                debug!("Initial noise floor estimated over {} bins", magnitude.len());
                self.noise_floor = Some(magnitude.to_vec());
            }
        }
    }
}

/// Symmetric Hann window.
pub fn hann_window(len: usize) -> Vec<f32> {
    if len == 1 {
        return vec![1.0];
    }
    let denom = (len - 1) as f32;
    (0..len).map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / denom).cos()).collect()
}
