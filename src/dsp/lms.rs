use ndarray::{aview1, Array1};

/// Least-mean-squares adaptive filter.
///
/// For every sample the reference window is shifted (newest first), the filter predicts the
/// correlated component as `w · window`, emits `primary - estimate` and adapts with
/// `w += 2·μ·e·window`. Weights and window survive across calls; the tap count never changes.
pub struct LmsFilter {
    weights: Array1<f32>,
    // Two windows back to back so the newest `taps` samples are always a contiguous slice
    history: Vec<f32>,
    head: usize,
    taps: usize,
    step_size: f32,
}

impl LmsFilter {
    pub fn new(taps: usize, step_size: f32) -> Self {
        let taps = taps.max(1);
        LmsFilter {
            weights: Array1::zeros(taps),
            history: vec![0.0; taps * 2],
            head: taps,
            taps,
            step_size,
        }
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    pub fn step_size(&self) -> f32 {
        self.step_size
    }

    pub fn weights(&self) -> &[f32] {
        self.weights.as_slice().unwrap_or(&[])
    }

    /// Runs the filter over the common prefix of both signals.
    pub fn process(&mut self, primary: &[f32], reference: &[f32]) -> Vec<f32> {
        let len = primary.len().min(reference.len());
        let mut output = Vec::with_capacity(len);
        for (&p, &r) in primary.iter().zip(reference).take(len) {
            self.push_reference(r);
            let window = aview1(&self.history[self.head..self.head + self.taps]);
            let estimate = self.weights.dot(&window);
            let error = p - estimate;
            self.weights.scaled_add(2.0 * self.step_size * error, &window);
            output.push(error);
        }
        output
    }

    fn push_reference(&mut self, sample: f32) {
        if self.head == 0 {
            let taps = self.taps;
            self.history.copy_within(0..taps - 1, taps + 1);
            self.head = taps + 1;
        }
        self.head -= 1;
        self.history[self.head] = sample;
    }

    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
        self.head = self.taps;
    }
}
