use crate::clock::Clock;
use crate::notify::dispatcher::{DetectionEvent, EventType, Metadata, NotificationChannel, NotificationDispatcher};
use log::debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const QUIET_CHANNELS: &[NotificationChannel] = &[NotificationChannel::LiveSubscribers, NotificationChannel::FileLog];

/// Per-kind helpers over the dispatcher. Alarm notifications closer together than the flood
/// cooldown are dropped entirely; the other kinds only ever reach live subscribers and the log.
pub struct AlarmNotifier {
    dispatcher: Arc<NotificationDispatcher>,
    flood_cooldown: Duration,
    clock: Arc<dyn Clock>,
    last_alarm: Mutex<Option<Instant>>,
}

impl AlarmNotifier {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, flood_cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        AlarmNotifier {
            dispatcher,
            flood_cooldown,
            clock,
            last_alarm: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn notify_crying_detected(&self, confidence: f32, metadata: Metadata) {
        let event = DetectionEvent::new(EventType::CryingDetected, confidence).with_metadata(metadata);
        self.dispatcher.notify(event, Some(QUIET_CHANNELS));
    }

    pub fn notify_crying_confirmed(&self, confidence: f32, duration: Duration, metadata: Metadata) {
        let event = DetectionEvent::new(EventType::CryingConfirmed, confidence)
            .with_duration(duration)
            .with_metadata(metadata);
        self.dispatcher.notify(event, Some(QUIET_CHANNELS));
    }

    /// Sends on every channel. Returns `false` when suppressed by the flood cooldown.
    pub fn notify_alarm_triggered(
        &self,
        confidence: f32,
        duration: Duration,
        audio_file: Option<PathBuf>,
        metadata: Metadata,
    ) -> bool {
        let now = self.clock.now();
        {
            let mut last = self.last_alarm.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if now.saturating_duration_since(previous) < self.flood_cooldown {
                    debug!("Skipping notification due to cooldown");
                    return false;
                }
            }
            *last = Some(now);
        }
        let event = DetectionEvent::new(EventType::AlarmTriggered, confidence)
            .with_duration(duration)
            .with_audio_file(audio_file)
            .with_metadata(metadata);
        self.dispatcher.notify(event, None);
        true
    }

    pub fn notify_alarm_acknowledged(&self, metadata: Metadata) {
        let event = DetectionEvent::new(EventType::AlarmAcknowledged, 1.0).with_metadata(metadata);
        self.dispatcher.notify(event, Some(QUIET_CHANNELS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NotificationConfig;

    fn notifier() -> (AlarmNotifier, Arc<ManualClock>) {
        let dispatcher = Arc::new(NotificationDispatcher::new(NotificationConfig {
            local_sound_enabled: false,
            log_file: None,
            ..NotificationConfig::default()
        }));
        let clock = Arc::new(ManualClock::new());
        (AlarmNotifier::new(dispatcher, Duration::from_secs(5), clock.clone()), clock)
    }

    #[test]
    fn alarm_flood_is_suppressed() {
        let (notifier, clock) = notifier();
        assert!(notifier.notify_alarm_triggered(0.9, Duration::from_secs(3), None, Metadata::new()));
        clock.advance(Duration::from_secs(2));
        assert!(!notifier.notify_alarm_triggered(0.9, Duration::from_secs(3), None, Metadata::new()));
        assert_eq!(notifier.dispatcher().history_len(), 1);

        clock.advance(Duration::from_secs(3));
        assert!(notifier.notify_alarm_triggered(0.9, Duration::from_secs(3), None, Metadata::new()));
        assert_eq!(notifier.dispatcher().history(10, Some(EventType::AlarmTriggered)).len(), 2);
    }

    #[test]
    fn other_kinds_are_never_throttled() {
        let (notifier, _clock) = notifier();
        let mut rx = notifier.dispatcher().subscribe();
        for _ in 0..3 {
            notifier.notify_crying_detected(0.85, Metadata::new());
        }
        notifier.notify_crying_confirmed(0.9, Duration::from_secs(3), Metadata::new());
        notifier.notify_alarm_acknowledged(Metadata::new());

        let history = notifier.dispatcher().history(10, None);
        assert_eq!(history.len(), 5);
        assert_eq!(history[3].event_type, EventType::CryingConfirmed);
        assert_eq!(history[3].duration, 3.0);
        assert_eq!(history[4].confidence, 1.0);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
    }
}
