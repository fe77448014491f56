use crate::config::NotificationConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::player::AlarmSound;
use chrono::{DateTime, Local};
use log::{debug, error, info, trace, warn};
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

const LIVE_CAPACITY: usize = 64;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(any(target_os = "linux", target_os = "macos"))]
const SYSTEM_SOUND_TIMEOUT: Duration = Duration::from_secs(3);
const ALERT_TONE_HZ: f32 = 800.0;
const ALERT_TONE_DURATION: Duration = Duration::from_secs(2);
const ALERT_TONE_VOLUME: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CryingDetected,
    CryingConfirmed,
    AlarmTriggered,
    AlarmAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Local>,
    pub event_type: EventType,
    pub confidence: f32,
    /// Seconds of sustained crying.
    pub duration: f64,
    pub audio_file: Option<PathBuf>,
    pub metadata: Metadata,
}

impl DetectionEvent {
    pub fn new(event_type: EventType, confidence: f32) -> Self {
        DetectionEvent {
            timestamp: Local::now(),
            event_type,
            confidence,
            duration: 0.0,
            audio_file: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration.as_secs_f64();
        self
    }

    pub fn with_audio_file(mut self, audio_file: Option<PathBuf>) -> Self {
        self.audio_file = audio_file;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    LiveSubscribers,
    Webhook,
    LocalSound,
    FileLog,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 4] = [
        NotificationChannel::LiveSubscribers,
        NotificationChannel::Webhook,
        NotificationChannel::LocalSound,
        NotificationChannel::FileLog,
    ];
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationChannel::LiveSubscribers => "live_subscribers",
            NotificationChannel::Webhook => "webhook",
            NotificationChannel::LocalSound => "local_sound",
            NotificationChannel::FileLog => "file_log",
        };
        f.write_str(name)
    }
}

/// Fans detection events out to the configured sinks and keeps a bounded history.
pub struct NotificationDispatcher {
    config: NotificationConfig,
    history: Mutex<VecDeque<DetectionEvent>>,
    live: broadcast::Sender<DetectionEvent>,
    webhook: Option<(reqwest::Url, reqwest::blocking::Client)>,
    audio_player: RwLock<Option<Arc<dyn AlarmSound>>>,
    log_lock: Mutex<()>,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig) -> Self {
        let webhook = config.webhook_url.as_deref().and_then(|url| match webhook_client(url) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Webhook notifications disabled: {}", e);
                None
            }
        });
        if let Some(dir) = config.log_file.as_deref().and_then(Path::parent) {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!("Cannot create notification log directory {:?}: {}", dir, e);
            }
        }
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        NotificationDispatcher {
            history: Mutex::new(VecDeque::with_capacity(config.max_history)),
            config,
            live,
            webhook,
            audio_player: RwLock::new(None),
            log_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Records the event, then hands it to each channel (all of them when `channels` is `None`).
    /// A failing channel is logged and does not affect the others.
    pub fn notify(&self, event: DetectionEvent, channels: Option<&[NotificationChannel]>) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(event.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
        for channel in channels.unwrap_or(&NotificationChannel::ALL) {
            match catch_unwind(AssertUnwindSafe(|| self.dispatch(*channel, &event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Notification error on {}: {}", channel, e),
                Err(_) => error!("Notification channel {} panicked", channel),
            }
        }
    }

    fn dispatch(&self, channel: NotificationChannel, event: &DetectionEvent) -> MonitorResult<()> {
        match channel {
            NotificationChannel::LiveSubscribers => {
                if self.live.send(event.clone()).is_err() {
                    trace!("No live subscribers");
                }
                Ok(())
            }
            NotificationChannel::Webhook => self.send_webhook(event),
            NotificationChannel::LocalSound => self.play_local_sound(event),
            NotificationChannel::FileLog => self.append_to_log(event),
        }
    }

    fn send_webhook(&self, event: &DetectionEvent) -> MonitorResult<()> {
        let (url, client) = match &self.webhook {
            Some(webhook) => webhook.clone(),
            None => return Ok(()),
        };
        let body = event.clone();
        std::thread::Builder::new().name("webhook".to_string()).spawn(move || {
            match client.post(url).json(&body).send() {
                Ok(response) => debug!("Webhook sent: {}", response.status()),
                Err(e) => warn!("Webhook failed: {}", e),
            }
        })?;
        Ok(())
    }

    fn play_local_sound(&self, event: &DetectionEvent) -> MonitorResult<()> {
        if !self.config.local_sound_enabled || event.event_type != EventType::AlarmTriggered {
            return Ok(());
        }
        let player = self.audio_player.read().unwrap_or_else(PoisonError::into_inner).clone();
        std::thread::Builder::new().name("local-sound".to_string()).spawn(move || {
            play_system_alert();
            match player {
                // never cut short the alarm file or tone already sounding
                Some(player) if player.is_busy() => debug!("Alarm sound already playing"),
                Some(player) => {
                    if let Err(e) = player.play_alarm_tone(ALERT_TONE_HZ, ALERT_TONE_DURATION, ALERT_TONE_VOLUME) {
                        debug!("Audio player sound failed: {}", e);
                    }
                }
                None => {}
            }
        })?;
        Ok(())
    }

    fn append_to_log(&self, event: &DetectionEvent) -> MonitorResult<()> {
        let path = match &self.config.log_file {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut entry = match serde_json::to_value(event)? {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        };
        entry.insert("logged_at".to_string(), serde_json::Value::String(Local::now().to_rfc3339()));
        let line = serde_json::to_string(&entry)?;

        let _guard = self.log_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.live.subscribe()
    }

    /// Newest `limit` entries in insertion order, optionally of one type only.
    pub fn history(&self, limit: usize, event_type: Option<EventType>) -> Vec<DetectionEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&DetectionEvent> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!("Detection history cleared");
    }

    pub fn set_audio_player(&self, player: Arc<dyn AlarmSound>) {
        *self.audio_player.write().unwrap_or_else(PoisonError::into_inner) = Some(player);
    }
}

fn webhook_client(url: &str) -> MonitorResult<(reqwest::Url, reqwest::blocking::Client)> {
    let url = reqwest::Url::parse(url).map_err(|e| MonitorError::Config(format!("Invalid webhook URL: {}", e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(MonitorError::Config("Webhook URL must use http or https".to_string()));
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .user_agent(concat!("crywatch/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok((url, client))
}

fn play_system_alert() {
    #[cfg(target_os = "linux")]
    run_with_timeout("speaker-test", &["-t", "sine", "-f", "800", "-l", "1"]);
    #[cfg(target_os = "macos")]
    run_with_timeout("afplay", &["/System/Library/Sounds/Glass.aiff"]);
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_with_timeout(program: &str, args: &[&str]) {
    use std::process::{Command, Stdio};

    let mut child = match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!("{} unavailable: {}", program, e);
            return;
        }
    };
    let deadline = Instant::now() + SYSTEM_SOUND_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => sleep(Duration::from_millis(50)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    }
}
