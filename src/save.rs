use crate::converters::f32_to_i16;
use crate::error::MonitorResult;
use chrono::{DateTime, TimeZone};
use hound::{SampleFormat, WavReader};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Decoded WAV contents, samples still interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct WavData {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Writes mono 16-bit PCM. The data goes to `<path>.part` first and is renamed into place, so
/// readers never see a half-written recording.
pub fn save_wav(samples: &[i16], sample_rate: u32, path: &Path) -> MonitorResult<PathBuf> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let mut writer = hound::WavWriter::create(&partial, spec)?;
    for s in samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    fs::rename(&partial, path)?;
    debug!("Recording saved to {:?}, {} samples at {} Hz", path, samples.len(), sample_rate);
    Ok(path.to_path_buf())
}

/// `<dir>/<prefix>_YYYYmmdd_HHMMSS.wav`
pub fn recording_path<Tz: TimeZone>(dir: &Path, prefix: &str, at: &DateTime<Tz>) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    dir.join(format!("{}_{}.wav", prefix, at.format("%Y%m%d_%H%M%S")))
}

/// Loads a whole WAV file as i16, converting float files on the way.
pub fn load_wav(path: &Path) -> MonitorResult<WavData> {
    info!("Reading file {:?}", path);
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| f32_to_i16(&v)))
            .collect::<Result<Vec<i16>, _>>()?,
        SampleFormat::Int if spec.bits_per_sample <= 16 => reader.samples::<i16>().collect::<Result<Vec<i16>, _>>()?,
        SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<Vec<i16>, _>>()?
        }
    };
    Ok(WavData {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("clip.wav");
        let samples: Vec<i16> = (0..1600).map(|i| (i * 7 % 2000) as i16 - 1000).collect();
        let saved = save_wav(&samples, 16_000, &path).unwrap();
        assert_eq!(saved, path);
        assert!(!dir.path().join("nested").join("clip.wav.part").exists());

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate, 16_000);
        assert_eq!(loaded.channels, 1);
        assert_eq!(loaded.samples, samples);
    }

    #[test]
    fn float_files_are_converted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.5f32, -0.5, 0.0, 1.0] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.channels, 2);
        assert_eq!(loaded.samples, vec![16384, -16384, 0, i16::MAX]);
    }

    #[test]
    fn recording_names_carry_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let path = recording_path(Path::new("recordings"), "crying", &at);
        assert_eq!(path, PathBuf::from("recordings/crying_20240309_070501.wav"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_wav(Path::new("/nonexistent/never.wav")).is_err());
    }
}
