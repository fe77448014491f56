/// Scales a float sample in [-1.0, 1.0) back to i16, clipping out-of-range values.
pub fn f32_to_i16(sample: &f32) -> i16 {
    (sample * 32768.0).clamp(-32768.0, 32767.0) as i16
}

pub fn i16_to_f32(sample: &i16) -> f32 {
    *sample as f32 / 32768.0
}

/// Decodes little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Averages interleaved channels into mono. An incomplete trailing frame is dropped.
pub fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion() {
        use approx::assert_relative_eq;
        let i = vec![0i16, 14, 31, 22, 150, -256, -1i16, i16::MIN, i16::MAX];
        let f: Vec<f32> = i.iter().map(i16_to_f32).collect();
        let ii: Vec<i16> = f.iter().map(f32_to_i16).collect();
        for (x, y) in ii.iter().zip(i) {
            assert_relative_eq!(*x as f32, y as f32, epsilon = 1.0);
        }
    }

    #[test]
    fn test_clipping() {
        assert_eq!(f32_to_i16(&1.5), i16::MAX);
        assert_eq!(f32_to_i16(&-2.0), i16::MIN);
    }

    #[test]
    fn test_bytes() {
        let bytes = samples_to_bytes(&[1, -2, i16::MAX]);
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff, 0xff, 0x7f]);
        let mut odd = bytes.clone();
        odd.push(9);
        assert_eq!(bytes_to_samples(&odd), vec![1, -2, i16::MAX]);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[100, 200, -100, -300, 7], 2);
        assert_eq!(mono, vec![150, -200]);
    }

    #[test]
    fn test_downmix_mono_is_copy() {
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}
