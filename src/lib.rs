use std::time::Duration;

pub mod alarm;
pub mod capture;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod converters;
pub mod device;
pub mod dsp;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod notify;
pub mod observer;
pub mod player;
pub mod queue;
pub mod reference_bus;
pub mod rms;
pub mod save;
mod worker;

pub use alarm::{AlarmEvent, AlarmManager, AlarmState};
pub use capture::{AudioCapture, AudioSource};
pub use classifier::{SoundCategory, SoundClassifier, SoundEvent};
pub use config::MonitorConfig;
pub use error::{MonitorError, MonitorResult};
pub use monitor::{run_monitor_sync, CryMonitor};
pub use notify::{DetectionEvent, EventType, NotificationDispatcher};
pub use player::AudioPlayer;

/// Audio handed to the classifier per decision.
pub const CLASSIFY_WINDOW: Duration = Duration::from_secs(1);
