use crate::alarm::state::{AlarmState, AlarmStateMachine, Step};
use crate::capture::AudioSource;
use crate::classifier::{SoundClassifier, SoundEvent};
use crate::clock::Clock;
use crate::config::AlarmConfig;
use crate::error::MonitorResult;
use crate::notify::{AlarmNotifier, DetectionEvent, Metadata};
use crate::observer::{AlarmObserver, ObserverId, ObserverList};
use crate::player::AlarmSound;
use crate::save::recording_path;
use crate::worker::Worker;
use chrono::{DateTime, Local};
use log::{debug, error, info, trace, warn};
use serde_derive::Serialize;
use serde_json::Value;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::sleep;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_PAUSE: Duration = Duration::from_millis(100);
const EMPTY_BUFFER_PAUSE: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One alarm trigger, handed to every [`AlarmObserver`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub timestamp: DateTime<Local>,
    pub state: AlarmState,
    /// Seconds of crying before the alarm fired.
    pub duration_secs: f64,
    pub audio_file: Option<PathBuf>,
    pub confidence: f32,
}

struct Inner {
    source: Arc<dyn AudioSource>,
    sound: Option<Arc<dyn AlarmSound>>,
    classifier: Mutex<Box<dyn SoundClassifier>>,
    notifier: Arc<AlarmNotifier>,
    config: RwLock<AlarmConfig>,
    clock: Arc<dyn Clock>,
    machine: Mutex<AlarmStateMachine>,
    // written under the machine lock, read lock-free by status queries
    state: AtomicU8,
    observers: ObserverList<dyn AlarmObserver>,
}

struct Running {
    cancel: CancellationToken,
    worker: Worker,
}

/// Polls the audio source about once a second, classifies each buffer and drives the
/// [`AlarmStateMachine`]. Confirmed crying records a clip, sounds the alarm and notifies.
pub struct AlarmManager {
    inner: Arc<Inner>,
    run: Mutex<Option<Running>>,
}

impl AlarmManager {
    pub fn new(
        source: Arc<dyn AudioSource>,
        sound: Option<Arc<dyn AlarmSound>>,
        classifier: Box<dyn SoundClassifier>,
        notifier: Arc<AlarmNotifier>,
        config: AlarmConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let machine = AlarmStateMachine::new(config.detection_duration(), config.cooldown_duration());
        AlarmManager {
            inner: Arc::new(Inner {
                source,
                sound,
                classifier: Mutex::new(classifier),
                notifier,
                config: RwLock::new(config),
                clock,
                machine: Mutex::new(machine),
                state: AtomicU8::new(AlarmState::Idle.as_u8()),
                observers: ObserverList::new(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Loads the classifier if needed and starts the monitor thread. No-op when running.
    pub fn start(&self) -> MonitorResult<()> {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.is_some() {
            return Ok(());
        }
        {
            let mut classifier = self.inner.classifier();
            if !classifier.is_loaded() {
                if let Err(e) = classifier.load() {
                    error!("Failed to load classifier, cannot start alarm manager");
                    return Err(e);
                }
            }
        }
        let dir = self.inner.config().recordings_dir.clone();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!("Cannot create recordings directory {}: {}", dir.display(), e);
        }
        self.inner.reset();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();
        let worker = Worker::spawn("alarm-monitor", move || inner.monitor_loop(&token))?;
        *run = Some(Running { cancel, worker });
        info!("Alarm manager started");
        Ok(())
    }

    pub fn stop(&self) {
        let running = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(running) = running {
            running.cancel.cancel();
            running.worker.join_timeout(STOP_TIMEOUT);
            self.inner.reset();
            info!("Alarm manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Last published state. May trail a transition happening on the monitor thread.
    pub fn state(&self) -> AlarmState {
        AlarmState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Feeds one classification through the state machine. Returns the alarm it raised, if any.
    pub fn process_sound_event(&self, event: &SoundEvent) -> Option<AlarmEvent> {
        self.inner.process_sound_event(event)
    }

    /// Ends the cooldown early. Returns `false` outside of cooldown.
    pub fn acknowledge(&self) -> bool {
        if self.state() != AlarmState::Cooldown {
            return false;
        }
        let acknowledged = {
            let mut machine = self.inner.machine();
            let acknowledged = machine.acknowledge();
            self.inner.publish(machine.state());
            acknowledged
        };
        if acknowledged {
            self.inner.notifier.notify_alarm_acknowledged(Metadata::new());
            info!("Alarm acknowledged, resuming monitoring");
        }
        acknowledged
    }

    /// Runs the full trigger sequence regardless of what the classifier currently hears.
    pub fn test_alarm(&self) -> AlarmEvent {
        info!("Triggering test alarm");
        {
            let mut machine = self.inner.machine();
            machine.begin_alarm(self.inner.clock.now());
            self.inner.publish(machine.state());
        }
        self.inner.trigger_alarm(1.0)
    }

    pub fn add_observer(&self, observer: Arc<dyn AlarmObserver>) -> ObserverId {
        self.inner.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.remove(id)
    }

    pub fn detection_history(&self, limit: usize) -> Vec<DetectionEvent> {
        self.inner.notifier.dispatcher().history(limit, None)
    }

    pub fn clear_detection_history(&self) {
        self.inner.notifier.dispatcher().clear_history()
    }

    pub fn config(&self) -> AlarmConfig {
        self.inner.config().clone()
    }

    /// Replaces the configuration. New durations apply to a detection already in progress.
    pub fn update_config(&self, config: AlarmConfig) -> MonitorResult<()> {
        config.validate()?;
        if let Err(e) = fs::create_dir_all(&config.recordings_dir) {
            warn!("Cannot create recordings directory {}: {}", config.recordings_dir.display(), e);
        }
        self.inner
            .machine()
            .set_durations(config.detection_duration(), config.cooldown_duration());
        info!("Updated alarm config: {:?}", config);
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

impl Drop for AlarmManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn machine(&self) -> MutexGuard<'_, AlarmStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn classifier(&self) -> MutexGuard<'_, Box<dyn SoundClassifier>> {
        self.classifier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> std::sync::RwLockReadGuard<'_, AlarmConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: AlarmState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn reset(&self) {
        let mut machine = self.machine();
        machine.reset();
        self.publish(machine.state());
    }

    fn monitor_loop(&self, cancel: &CancellationToken) {
        debug!("Alarm monitor running");
        while !cancel.is_cancelled() {
            let pause = match catch_unwind(AssertUnwindSafe(|| self.poll_once())) {
                Ok(Ok(pause)) => pause,
                Ok(Err(e)) => {
                    error!("Monitor loop error: {}", e);
                    ERROR_BACKOFF
                }
                Err(_) => {
                    error!("Monitor loop panicked, continuing");
                    ERROR_BACKOFF
                }
            };
            if !cancel.is_cancelled() {
                sleep(pause);
            }
        }
        debug!("Alarm monitor finished");
    }

    fn poll_once(&self) -> MonitorResult<Duration> {
        let audio = self.source.get_buffer(crate::CLASSIFY_WINDOW);
        if audio.is_empty() {
            return Ok(EMPTY_BUFFER_PAUSE);
        }
        let event = self.classifier().classify(&audio)?;
        trace!("Classified {:?} ({:.2}) as {}", event.category, event.confidence, event.label);
        self.process_sound_event(&event);
        Ok(POLL_PAUSE)
    }

    fn process_sound_event(&self, event: &SoundEvent) -> Option<AlarmEvent> {
        let (step, detections) = {
            let mut machine = self.machine();
            let step = machine.on_sound(event.is_crying(), self.clock.now());
            self.publish(machine.state());
            (step, machine.detection_count())
        };
        match step {
            Step::CryingStarted => {
                info!("Crying detected, confidence: {:.2}", event.confidence);
                self.notifier
                    .notify_crying_detected(event.confidence, label_metadata(&event.label));
                None
            }
            Step::StillDetecting { elapsed } => {
                trace!("Crying for {:.1}s ({} detections)", elapsed.as_secs_f32(), detections);
                None
            }
            Step::Confirmed { elapsed } => {
                info!("Crying confirmed after {:.1}s, triggering alarm", elapsed.as_secs_f32());
                let mut metadata = label_metadata(&event.label);
                metadata.insert("detection_count".to_string(), Value::from(detections));
                self.notifier.notify_crying_confirmed(event.confidence, elapsed, metadata);
                Some(self.trigger_alarm(event.confidence))
            }
            Step::CryingStopped => {
                debug!("Crying stopped, resetting detection");
                None
            }
            Step::CooldownExpired => {
                info!("Cooldown complete, resuming monitoring");
                None
            }
            Step::Unchanged => None,
        }
    }

    /// Runs with the machine in `Alarming`. Every side effect is best effort; the machine
    /// always ends in cooldown.
    fn trigger_alarm(&self, confidence: f32) -> AlarmEvent {
        let config = self.config().clone();
        let audio_file = self.record_clip(&config);
        self.sound_alarm(&config);

        let elapsed = self.machine().elapsed(self.clock.now());
        let event = AlarmEvent {
            timestamp: Local::now(),
            state: AlarmState::Alarming,
            duration_secs: elapsed.as_secs_f64(),
            audio_file: audio_file.clone(),
            confidence,
        };
        let failed = self.observers.notify(|observer| observer.on_alarm(&event));
        if failed > 0 {
            error!("{} alarm callbacks failed", failed);
        }
        self.notifier
            .notify_alarm_triggered(confidence, elapsed, audio_file, Metadata::new());

        {
            let mut machine = self.machine();
            machine.finish_alarm(self.clock.now());
            self.publish(machine.state());
        }
        info!("Alarm triggered, entering cooldown");
        event
    }

    fn record_clip(&self, config: &AlarmConfig) -> Option<PathBuf> {
        let path = recording_path(&config.recordings_dir, "crying", &Local::now());
        match self.source.record_clip(config.recording_duration(), &path) {
            Ok(path) => {
                info!("Recorded alarm clip {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to record audio: {}", e);
                None
            }
        }
    }

    fn sound_alarm(&self, config: &AlarmConfig) {
        let Some(sound) = &self.sound else {
            debug!("No alarm sound output configured");
            return;
        };
        if let Some(path) = config.alarm_sound_path.as_deref().filter(|p| p.exists()) {
            match sound.play_alarm_file(path) {
                Ok(()) => return,
                Err(e) => error!("Failed to play alarm: {}", e),
            }
        }
        let duration = config.tone_duration();
        if let Err(e) = sound.play_alarm_tone(config.tone_frequency_hz, duration, config.tone_volume) {
            error!("Failed to play tone: {}", e);
        }
    }
}

fn label_metadata(label: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("label".to_string(), Value::from(label));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SoundCategory;
    use crate::clock::ManualClock;
    use crate::config::NotificationConfig;
    use crate::error::MonitorError;
    use crate::notify::{EventType, NotificationDispatcher};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeSource {
        clips: Mutex<Vec<PathBuf>>,
        fail_recording: bool,
    }

    impl AudioSource for FakeSource {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn get_buffer(&self, _duration: Duration) -> Vec<i16> {
            vec![]
        }

        fn record_clip(&self, _duration: Duration, path: &Path) -> MonitorResult<PathBuf> {
            if self.fail_recording {
                return Err(MonitorError::Device("no audio".to_string()));
            }
            self.clips.lock().unwrap().push(path.to_path_buf());
            Ok(path.to_path_buf())
        }
    }

    #[derive(Default)]
    struct FakeSound {
        files: Mutex<Vec<PathBuf>>,
        tones: Mutex<Vec<(f32, Duration, f32)>>,
        fail_files: bool,
    }

    impl AlarmSound for FakeSound {
        fn play_alarm_file(&self, path: &Path) -> MonitorResult<()> {
            if self.fail_files {
                return Err(MonitorError::Playback("broken".to_string()));
            }
            self.files.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn play_alarm_tone(&self, frequency_hz: f32, duration: Duration, volume: f32) -> MonitorResult<()> {
            self.tones.lock().unwrap().push((frequency_hz, duration, volume));
            Ok(())
        }
    }

    struct FixedClassifier {
        loadable: bool,
        loaded: bool,
    }

    impl SoundClassifier for FixedClassifier {
        fn load(&mut self) -> MonitorResult<()> {
            if self.loadable {
                self.loaded = true;
                Ok(())
            } else {
                Err(MonitorError::Classifier("model file missing".to_string()))
            }
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }

        fn classify(&mut self, _samples: &[i16]) -> MonitorResult<SoundEvent> {
            Ok(SoundEvent::new(SoundCategory::Silence, 0.95, "Silence"))
        }
    }

    struct Fixture {
        manager: AlarmManager,
        clock: Arc<ManualClock>,
        source: Arc<FakeSource>,
        sound: Arc<FakeSound>,
        _dir: TempDir,
    }

    fn fixture_with(source: FakeSource, sound: FakeSound, loadable: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(NotificationConfig {
            local_sound_enabled: false,
            log_file: None,
            ..NotificationConfig::default()
        }));
        let notifier = Arc::new(AlarmNotifier::new(dispatcher, Duration::from_secs(5), clock.clone()));
        let config = AlarmConfig {
            cooldown_duration_secs: 5.0,
            recordings_dir: dir.path().join("recordings"),
            ..AlarmConfig::default()
        };
        let source = Arc::new(source);
        let sound = Arc::new(sound);
        let manager = AlarmManager::new(
            source.clone(),
            Some(sound.clone()),
            Box::new(FixedClassifier { loadable, loaded: false }),
            notifier,
            config,
            clock.clone(),
        );
        Fixture {
            manager,
            clock,
            source,
            sound,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeSource::default(), FakeSound::default(), true)
    }

    fn crying() -> SoundEvent {
        SoundEvent::new(SoundCategory::Crying, 0.9, "Baby cry, infant cry")
    }

    #[test]
    fn confirmation_runs_trigger_sequence() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        f.manager
            .add_observer(Arc::new(move |e: &AlarmEvent| sink.lock().unwrap().push(e.clone())));

        for _ in 0..3 {
            assert!(f.manager.process_sound_event(&crying()).is_none());
            f.clock.advance(Duration::from_secs(1));
        }
        let event = f.manager.process_sound_event(&crying()).unwrap();
        assert_eq!(event.state, AlarmState::Alarming);
        assert_eq!(event.duration_secs, 3.0);
        assert_eq!(event.confidence, 0.9);
        assert_eq!(f.manager.state(), AlarmState::Cooldown);

        let clips = f.source.clips.lock().unwrap().clone();
        assert_eq!(clips.len(), 1);
        assert_eq!(event.audio_file.as_ref(), Some(&clips[0]));
        assert!(clips[0].file_name().unwrap().to_string_lossy().starts_with("crying_"));
        assert_eq!(*f.sound.tones.lock().unwrap(), vec![(800.0, Duration::from_secs(2), 0.5)]);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let kinds: Vec<EventType> = f.manager.detection_history(10).iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![EventType::CryingDetected, EventType::CryingConfirmed, EventType::AlarmTriggered]
        );
    }

    #[test]
    fn failed_side_effects_still_reach_cooldown() {
        let dir = tempdir().unwrap();
        let alarm_file = dir.path().join("alarm.wav");
        fs::write(&alarm_file, b"not really audio").unwrap();
        let f = fixture_with(
            FakeSource {
                fail_recording: true,
                ..FakeSource::default()
            },
            FakeSound {
                fail_files: true,
                ..FakeSound::default()
            },
            true,
        );
        let mut config = f.manager.config();
        config.alarm_sound_path = Some(alarm_file);
        f.manager.update_config(config).unwrap();
        f.manager.add_observer(Arc::new(|_: &AlarmEvent| panic!("observer failure")));

        let event = f.manager.test_alarm();
        assert_eq!(event.audio_file, None);
        assert_eq!(event.confidence, 1.0);
        // file playback failed, the tone stands in
        assert_eq!(f.sound.tones.lock().unwrap().len(), 1);
        assert_eq!(f.manager.state(), AlarmState::Cooldown);
        assert_eq!(f.manager.detection_history(10).len(), 1);
    }

    #[test]
    fn configured_sound_file_replaces_tone() {
        let dir = tempdir().unwrap();
        let alarm_file = dir.path().join("alarm.wav");
        fs::write(&alarm_file, b"RIFF").unwrap();
        let f = fixture();
        let mut config = f.manager.config();
        config.alarm_sound_path = Some(alarm_file.clone());
        f.manager.update_config(config).unwrap();

        f.manager.test_alarm();
        assert_eq!(*f.sound.files.lock().unwrap(), vec![alarm_file]);
        assert!(f.sound.tones.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_sound_file_falls_back_to_tone() {
        let f = fixture();
        let mut config = f.manager.config();
        config.alarm_sound_path = Some(PathBuf::from("/nonexistent/alarm.wav"));
        f.manager.update_config(config).unwrap();

        f.manager.test_alarm();
        assert!(f.sound.files.lock().unwrap().is_empty());
        assert_eq!(f.sound.tones.lock().unwrap().len(), 1);
    }

    #[test]
    fn acknowledge_ends_cooldown() {
        let f = fixture();
        assert!(!f.manager.acknowledge());
        f.manager.test_alarm();
        assert!(f.manager.acknowledge());
        assert_eq!(f.manager.state(), AlarmState::Idle);
        assert!(!f.manager.acknowledge());
        let last = f.manager.detection_history(10).pop().unwrap();
        assert_eq!(last.event_type, EventType::AlarmAcknowledged);

        // detection starts again right away
        f.manager.process_sound_event(&crying());
        assert_eq!(f.manager.state(), AlarmState::Detecting);
    }

    #[test]
    fn update_config_validates() {
        let f = fixture();
        let mut config = f.manager.config();
        config.detection_duration_secs = -1.0;
        assert!(matches!(f.manager.update_config(config), Err(MonitorError::Config(_))));
        assert_eq!(f.manager.config().detection_duration_secs, 3.0);
    }

    #[test]
    fn start_fails_without_classifier() {
        let f = fixture_with(FakeSource::default(), FakeSound::default(), false);
        assert!(matches!(f.manager.start(), Err(MonitorError::Classifier(_))));
        assert!(!f.manager.is_running());
    }

    #[test]
    fn start_and_stop_monitor_thread() {
        let f = fixture();
        f.manager.start().unwrap();
        assert!(f.manager.is_running());
        f.manager.start().unwrap();
        sleep(Duration::from_millis(250));
        f.manager.stop();
        assert!(!f.manager.is_running());
        assert_eq!(f.manager.state(), AlarmState::Idle);
        assert!(f.manager.config().recordings_dir.is_dir());
    }

    #[test]
    fn clear_history() {
        let f = fixture();
        f.manager.test_alarm();
        f.manager.clear_detection_history();
        assert!(f.manager.detection_history(10).is_empty());
    }
}
