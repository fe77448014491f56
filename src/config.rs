use crate::error::{MonitorError, MonitorResult};
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest recording or alarm tone a config may ask for.
const MAX_CLIP_SECS: f32 = 3600.0;
/// Longest echo path the canceller models.
const MAX_ECHO_TAIL_SECS: f32 = 2.0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_size: usize,
    pub noise_reduction: bool,
    pub dual_mic: bool,
    pub echo_cancellation: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 48_000,     // USB camera mic native rate
            channels: 2,             // stereo capture, downmixed to mono
            block_size: 1024,        // ~21ms at 48kHz
            noise_reduction: true,
            dual_mic: false,         // stereo channels are used instead of a second device
            echo_cancellation: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EchoConfig {
    pub tail_secs: f32,
    pub step_size: f32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig {
            tail_secs: 0.1, // 100ms echo tail
            step_size: 0.01,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NoiseConfig {
    pub smoothing: f32,
    pub subtraction_factor: f32,
    pub spectral_floor: f32,
    pub vad_threshold: f32,
    pub seed_frames: u32,
    pub dual_mic_taps: usize,
    pub dual_mic_step_size: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        NoiseConfig {
            smoothing: 0.98,          // noise floor moves slowly
            subtraction_factor: 2.0,
            spectral_floor: 0.01,     // keeps over-subtraction from producing musical noise
            vad_threshold: 0.02,
            seed_frames: 50,          // ~1s at 48kHz / 1024
            dual_mic_taps: 128,
            dual_mic_step_size: 0.01,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub threshold: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig { threshold: 0.8 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AlarmConfig {
    pub detection_duration_secs: f32,
    pub cooldown_duration_secs: f32,
    pub recording_duration_secs: f32,
    pub recordings_dir: PathBuf,
    pub alarm_sound_path: Option<PathBuf>,
    pub tone_frequency_hz: f32,
    pub tone_duration_secs: f32,
    pub tone_volume: f32,
}

impl AlarmConfig {
    pub fn detection_duration(&self) -> Duration {
        seconds(self.detection_duration_secs)
    }

    pub fn cooldown_duration(&self) -> Duration {
        seconds(self.cooldown_duration_secs)
    }

    pub fn recording_duration(&self) -> Duration {
        seconds(self.recording_duration_secs)
    }

    pub fn tone_duration(&self) -> Duration {
        seconds(self.tone_duration_secs)
    }

    pub fn validate(&self) -> MonitorResult<()> {
        checked_secs("detection duration", self.detection_duration_secs, false)?;
        checked_secs("cooldown duration", self.cooldown_duration_secs, true)?;
        let recording = checked_secs("recording duration", self.recording_duration_secs, false)?;
        let tone = checked_secs("tone duration", self.tone_duration_secs, false)?;
        if recording.as_secs_f32() > MAX_CLIP_SECS || tone.as_secs_f32() > MAX_CLIP_SECS {
            return Err(config_error(format!("recordings and tones are limited to {}s", MAX_CLIP_SECS)));
        }
        if !(0.0..=1.0).contains(&self.tone_volume) || !self.tone_frequency_hz.is_finite() || self.tone_frequency_hz <= 0.0 {
            return Err(config_error("alarm tone settings out of range"));
        }
        Ok(())
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        AlarmConfig {
            detection_duration_secs: 3.0,  // sustained crying before the alarm fires
            cooldown_duration_secs: 30.0,
            recording_duration_secs: 10.0,
            recordings_dir: PathBuf::from("/tmp/crywatch/recordings"),
            alarm_sound_path: None,
            tone_frequency_hz: 800.0,
            tone_duration_secs: 2.0,
            tone_volume: 0.5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub local_sound_enabled: bool,
    pub log_file: Option<PathBuf>,
    pub max_history: usize,
    pub flood_cooldown_secs: f32,
}

impl NotificationConfig {
    pub fn flood_cooldown(&self) -> Duration {
        seconds(self.flood_cooldown_secs)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            webhook_url: None,
            local_sound_enabled: true,
            log_file: Some(PathBuf::from("/tmp/crywatch/alerts.log")),
            max_history: 100,
            flood_cooldown_secs: 5.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct MonitorConfig {
    pub audio: AudioConfig,
    pub echo: EchoConfig,
    pub noise: NoiseConfig,
    pub classifier: ClassifierConfig,
    pub alarm: AlarmConfig,
    pub notification: NotificationConfig,
}

impl MonitorConfig {
    pub fn validate(&self) -> MonitorResult<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 || audio.channels == 0 || audio.block_size == 0 {
            return Err(config_error(format!(
                "sample rate, channels and block size must be positive, got {}Hz/{}ch/{}",
                audio.sample_rate, audio.channels, audio.block_size
            )));
        }
        let echo = &self.echo;
        if !(echo.tail_secs > 0.0 && echo.tail_secs <= MAX_ECHO_TAIL_SECS) || !(echo.step_size > 0.0 && echo.step_size.is_finite()) {
            return Err(config_error(format!(
                "echo tail must be in (0, {}]s and step size positive, got {}s/{}",
                MAX_ECHO_TAIL_SECS, echo.tail_secs, echo.step_size
            )));
        }
        let noise = &self.noise;
        if !(0.0..1.0).contains(&noise.smoothing) {
            return Err(config_error(format!("noise smoothing must be in [0, 1), got {}", noise.smoothing)));
        }
        if noise.subtraction_factor < 0.0 || noise.spectral_floor < 0.0 || noise.dual_mic_taps == 0 {
            return Err(config_error("noise subtraction parameters out of range"));
        }
        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(config_error(format!("classifier threshold must be in [0, 1], got {}", self.classifier.threshold)));
        }
        self.alarm.validate()?;
        let notification = &self.notification;
        if notification.max_history == 0 {
            return Err(config_error("notification history capacity must be positive"));
        }
        checked_secs("flood cooldown", notification.flood_cooldown_secs, true)?;
        Ok(())
    }
}

/// Validated configs always convert; anything else saturates instead of panicking.
fn seconds(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

fn checked_secs(name: &str, secs: f32, allow_zero: bool) -> MonitorResult<Duration> {
    let duration = Duration::try_from_secs_f32(secs)
        .map_err(|_| config_error(format!("{} must be a finite, non-negative number of seconds, got {}", name, secs)))?;
    if duration.is_zero() && !allow_zero {
        return Err(config_error(format!("{} must be positive", name)));
    }
    Ok(duration)
}

fn config_error(msg: impl Into<String>) -> MonitorError {
    MonitorError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_block_size() {
        let mut config = MonitorConfig::default();
        config.audio.block_size = 0;
        assert!(matches!(config.validate(), Err(MonitorError::Config(_))));
    }

    #[test]
    fn rejects_empty_history() {
        let mut config = MonitorConfig::default();
        config.notification.max_history = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unrepresentable_durations() {
        for bad in [1e30, f32::NAN, f32::INFINITY, -1.0] {
            let mut config = MonitorConfig::default();
            config.alarm.cooldown_duration_secs = bad;
            assert!(matches!(config.validate(), Err(MonitorError::Config(_))), "cooldown {}", bad);

            let mut config = MonitorConfig::default();
            config.notification.flood_cooldown_secs = bad;
            assert!(matches!(config.validate(), Err(MonitorError::Config(_))), "flood {}", bad);

            let mut config = MonitorConfig::default();
            config.alarm.detection_duration_secs = bad;
            assert!(config.validate().is_err(), "detection {}", bad);
        }
        let mut config = MonitorConfig::default();
        config.alarm.recording_duration_secs = 1e6;
        assert!(config.validate().is_err());
        config.alarm.recording_duration_secs = 10.0;
        config.echo.tail_secs = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_cooldowns_are_allowed() {
        let mut config = MonitorConfig::default();
        config.alarm.cooldown_duration_secs = 0.0;
        config.notification.flood_cooldown_secs = 0.0;
        assert!(config.validate().is_ok());
        assert_eq!(config.alarm.cooldown_duration(), Duration::ZERO);
    }

    #[test]
    fn duration_accessors_never_panic() {
        let mut config = MonitorConfig::default();
        config.alarm.cooldown_duration_secs = 1e30;
        config.alarm.detection_duration_secs = f32::NAN;
        config.notification.flood_cooldown_secs = -3.0;
        assert_eq!(config.alarm.cooldown_duration(), Duration::MAX);
        assert_eq!(config.alarm.detection_duration(), Duration::ZERO);
        assert_eq!(config.notification.flood_cooldown(), Duration::ZERO);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = MonitorConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let parsed: MonitorConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
