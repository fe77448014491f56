use thiserror::Error;

pub type MonitorResult<T> = Result<T, MonitorError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Not supported by this backend: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "cpal")]
impl From<cpal::BuildStreamError> for MonitorError {
    fn from(err: cpal::BuildStreamError) -> Self {
        MonitorError::Device(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::PlayStreamError> for MonitorError {
    fn from(err: cpal::PlayStreamError) -> Self {
        MonitorError::Device(err.to_string())
    }
}

#[cfg(feature = "cpal")]
impl From<cpal::DefaultStreamConfigError> for MonitorError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        MonitorError::Device(err.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        MonitorError::Webhook(err.to_string())
    }
}
