use crate::alarm::{AlarmManager, AlarmState};
use crate::capture::AudioCapture;
use crate::classifier::SoundClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::device::{open_backend, AudioBackend, BackendKind, PcmFormat, StreamDirection};
use crate::error::MonitorResult;
use crate::notify::{AlarmNotifier, DetectionEvent, NotificationDispatcher};
use crate::player::{AlarmSound, AudioPlayer, PLAYBACK_CHUNK};
use crate::reference_bus::PlaybackReferenceBus;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const RETRY_PAUSE: Duration = Duration::from_secs(1);
const SUPERVISOR_TICK: Duration = Duration::from_millis(200);

/// Capture, playback, classification and notification wired into one unit.
pub struct CryMonitor {
    config: MonitorConfig,
    bus: Option<Arc<PlaybackReferenceBus>>,
    capture: Arc<AudioCapture>,
    player: Option<Arc<AudioPlayer>>,
    notifier: Arc<AlarmNotifier>,
    alarm: AlarmManager,
}

impl CryMonitor {
    pub fn new(
        config: MonitorConfig,
        capture: Box<dyn AudioBackend>,
        secondary: Option<Box<dyn AudioBackend>>,
        playback: Option<Box<dyn AudioBackend>>,
        classifier: Box<dyn SoundClassifier>,
    ) -> MonitorResult<Self> {
        Self::with_clock(config, capture, secondary, playback, classifier, Arc::new(SystemClock))
    }

    /// Same as [`CryMonitor::new`] with every duration decision taken from `clock`.
    pub fn with_clock(
        config: MonitorConfig,
        capture: Box<dyn AudioBackend>,
        secondary: Option<Box<dyn AudioBackend>>,
        playback: Option<Box<dyn AudioBackend>>,
        classifier: Box<dyn SoundClassifier>,
        clock: Arc<dyn Clock>,
    ) -> MonitorResult<Self> {
        config.validate()?;

        let bus = playback.as_ref().map(|_| Arc::new(PlaybackReferenceBus::new()));
        let player = playback.map(|backend| {
            let rate = backend.format().sample_rate;
            Arc::new(AudioPlayer::new(backend, rate, bus.clone()))
        });
        let capture = Arc::new(AudioCapture::new(
            config.audio.clone(),
            config.echo.clone(),
            config.noise.clone(),
            capture,
            secondary,
            bus.clone(),
        ));

        let dispatcher = Arc::new(NotificationDispatcher::new(config.notification.clone()));
        if let Some(player) = &player {
            dispatcher.set_audio_player(player.clone());
        }
        let notifier = Arc::new(AlarmNotifier::new(
            dispatcher,
            config.notification.flood_cooldown(),
            clock.clone(),
        ));
        let sound = player.clone().map(|p| p as Arc<dyn AlarmSound>);
        let alarm = AlarmManager::new(
            capture.clone(),
            sound,
            classifier,
            notifier.clone(),
            config.alarm.clone(),
            clock,
        );

        Ok(CryMonitor {
            config,
            bus,
            capture,
            player,
            notifier,
            alarm,
        })
    }

    /// Starts capture, then the alarm monitor. A failing alarm start stops capture again.
    pub fn start(&self) -> MonitorResult<()> {
        self.capture.start()?;
        if let Err(e) = self.alarm.start() {
            self.capture.stop();
            return Err(e);
        }
        info!("Cry monitor started");
        Ok(())
    }

    pub fn stop(&self) {
        self.alarm.stop();
        self.capture.stop();
        if let Some(player) = &self.player {
            player.stop();
        }
        info!("Cry monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.alarm.is_running() && self.capture.is_recording()
    }

    pub fn state(&self) -> AlarmState {
        self.alarm.state()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn capture(&self) -> &Arc<AudioCapture> {
        &self.capture
    }

    pub fn player(&self) -> Option<&Arc<AudioPlayer>> {
        self.player.as_ref()
    }

    pub fn reference_bus(&self) -> Option<&Arc<PlaybackReferenceBus>> {
        self.bus.as_ref()
    }

    pub fn alarm(&self) -> &AlarmManager {
        &self.alarm
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        self.notifier.dispatcher()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.notifier.dispatcher().subscribe()
    }
}

impl Drop for CryMonitor {
    fn drop(&mut self) {
        self.alarm.stop();
        self.capture.stop();
    }
}

/// Opens the devices, runs a [`CryMonitor`] until `running` is cancelled and retries every
/// second when devices are missing. Missing playback only disables the speaker.
pub fn run_monitor_sync<F>(
    running: CancellationToken,
    config: MonitorConfig,
    capture: BackendKind,
    playback: Option<BackendKind>,
    classifier: F,
) -> MonitorResult<()>
where
    F: Fn() -> MonitorResult<Box<dyn SoundClassifier>>,
{
    config.validate()?;
    let mut mic_failing = false;
    while !running.is_cancelled() {
        match open_monitor(&config, &capture, playback.as_ref(), &classifier) {
            Ok(monitor) => {
                mic_failing = false;
                while !running.is_cancelled() && monitor.is_running() {
                    sleep(SUPERVISOR_TICK);
                }
                monitor.stop();
                debug!("Monitor loop finished");
            }
            Err(e) => {
                if !mic_failing {
                    warn!("Monitor init error {}", e);
                    mic_failing = true;
                } else {
                    debug!("Monitor init still failing: {}", e);
                }
            }
        }
        if !running.is_cancelled() {
            sleep(RETRY_PAUSE);
        }
    }
    Ok(())
}

fn open_monitor<F>(
    config: &MonitorConfig,
    capture: &BackendKind,
    playback: Option<&BackendKind>,
    classifier: &F,
) -> MonitorResult<CryMonitor>
where
    F: Fn() -> MonitorResult<Box<dyn SoundClassifier>>,
{
    let input = open_backend(capture, PcmFormat::from(&config.audio), StreamDirection::Capture)?;
    let output = match playback {
        Some(kind) => {
            let format = PcmFormat::new(config.audio.sample_rate, config.audio.channels, PLAYBACK_CHUNK);
            match open_backend(kind, format, StreamDirection::Playback) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!("No playback device, alarms stay silent: {}", e);
                    None
                }
            }
        }
        None => None,
    };
    let monitor = CryMonitor::new(config.clone(), input, None, output, classifier()?)?;
    monitor.start()?;
    Ok(monitor)
}
