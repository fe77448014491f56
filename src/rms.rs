/// Mean absolute level of a block, used for logging capture levels.
pub fn calculate_rms(chunk: &[i16]) -> i16 {
    if chunk.is_empty() {
        return 0;
    }
    // i64 keeps i16::MIN.abs() from overflowing
    let sum: u64 = chunk.iter().map(|&x| (x as i64).unsigned_abs()).sum();
    let average = sum / chunk.len() as u64;
    i16::try_from(average).unwrap_or(i16::MAX)
}

/// Mean squared amplitude of normalised samples; the voice activity gate compares this to a threshold.
pub fn mean_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
}

pub fn mean_magnitude(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| (s as f64).abs()).sum::<f64>() / samples.len() as f64
}
