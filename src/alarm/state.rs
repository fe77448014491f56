use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Idle,
    Detecting,
    Alarming,
    Cooldown,
}

impl AlarmState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            AlarmState::Idle => 0,
            AlarmState::Detecting => 1,
            AlarmState::Alarming => 2,
            AlarmState::Cooldown => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> AlarmState {
        match value {
            1 => AlarmState::Detecting,
            2 => AlarmState::Alarming,
            3 => AlarmState::Cooldown,
            _ => AlarmState::Idle,
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmState::Idle => "idle",
            AlarmState::Detecting => "detecting",
            AlarmState::Alarming => "alarming",
            AlarmState::Cooldown => "cooldown",
        };
        f.write_str(name)
    }
}

/// Outcome of feeding one classification into the machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Unchanged,
    CryingStarted,
    StillDetecting { elapsed: Duration },
    /// Crying lasted long enough. The machine is now `Alarming` and waits for `finish_alarm`.
    Confirmed { elapsed: Duration },
    CryingStopped,
    CooldownExpired,
}

/// Transition table for crying detection. Holds no clock of its own; every call gets `now`.
#[derive(Debug, Clone)]
pub struct AlarmStateMachine {
    state: AlarmState,
    detection_duration: Duration,
    cooldown_duration: Duration,
    crying_start: Option<Instant>,
    last_alarm: Option<Instant>,
    detection_count: u32,
}

impl AlarmStateMachine {
    pub fn new(detection_duration: Duration, cooldown_duration: Duration) -> Self {
        AlarmStateMachine {
            state: AlarmState::Idle,
            detection_duration,
            cooldown_duration,
            crying_start: None,
            last_alarm: None,
            detection_count: 0,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn set_durations(&mut self, detection_duration: Duration, cooldown_duration: Duration) {
        self.detection_duration = detection_duration;
        self.cooldown_duration = cooldown_duration;
    }

    pub fn detection_count(&self) -> u32 {
        self.detection_count
    }

    pub fn on_sound(&mut self, is_crying: bool, now: Instant) -> Step {
        match self.state {
            AlarmState::Idle if is_crying => {
                self.crying_start = Some(now);
                self.detection_count = 1;
                self.state = AlarmState::Detecting;
                Step::CryingStarted
            }
            AlarmState::Idle => Step::Unchanged,
            AlarmState::Detecting if is_crying => {
                self.detection_count += 1;
                let elapsed = self.elapsed(now);
                if elapsed >= self.detection_duration {
                    self.state = AlarmState::Alarming;
                    Step::Confirmed { elapsed }
                } else {
                    Step::StillDetecting { elapsed }
                }
            }
            AlarmState::Detecting => {
                self.crying_start = None;
                self.detection_count = 0;
                self.state = AlarmState::Idle;
                Step::CryingStopped
            }
            AlarmState::Cooldown => match self.last_alarm {
                Some(last) if now.saturating_duration_since(last) >= self.cooldown_duration => {
                    self.state = AlarmState::Idle;
                    Step::CooldownExpired
                }
                _ => Step::Unchanged,
            },
            AlarmState::Alarming => Step::Unchanged,
        }
    }

    /// Manual trigger: crying is taken to start now.
    pub fn begin_alarm(&mut self, now: Instant) {
        self.crying_start = Some(now);
        self.state = AlarmState::Alarming;
    }

    /// Time since crying started, zero when it never did.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.crying_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn finish_alarm(&mut self, now: Instant) {
        self.last_alarm = Some(now);
        self.crying_start = None;
        self.state = AlarmState::Cooldown;
    }

    /// Ends cooldown early. Does nothing in any other state.
    pub fn acknowledge(&mut self) -> bool {
        if self.state == AlarmState::Cooldown {
            self.state = AlarmState::Idle;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.state = AlarmState::Idle;
        self.crying_start = None;
        self.detection_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn machine() -> (AlarmStateMachine, Instant) {
        (AlarmStateMachine::new(3 * SEC, 5 * SEC), Instant::now())
    }

    #[test]
    fn short_crying_returns_to_idle() {
        let (mut m, t0) = machine();
        assert_eq!(m.on_sound(true, t0), Step::CryingStarted);
        assert_eq!(m.state(), AlarmState::Detecting);
        assert_eq!(m.on_sound(true, t0 + 2 * SEC), Step::StillDetecting { elapsed: 2 * SEC });
        assert_eq!(m.detection_count(), 2);
        assert_eq!(m.on_sound(false, t0 + Duration::from_millis(2900)), Step::CryingStopped);
        assert_eq!(m.state(), AlarmState::Idle);
        assert_eq!(m.detection_count(), 0);
    }

    #[test]
    fn sustained_crying_confirms() {
        let (mut m, t0) = machine();
        m.on_sound(true, t0);
        m.on_sound(true, t0 + SEC);
        m.on_sound(true, t0 + 2 * SEC);
        assert_eq!(m.on_sound(true, t0 + 3 * SEC), Step::Confirmed { elapsed: 3 * SEC });
        assert_eq!(m.state(), AlarmState::Alarming);
        assert_eq!(m.on_sound(true, t0 + 4 * SEC), Step::Unchanged);

        m.finish_alarm(t0 + 3 * SEC);
        assert_eq!(m.state(), AlarmState::Cooldown);
        assert_eq!(m.elapsed(t0 + 4 * SEC), Duration::ZERO);
    }

    #[test]
    fn cooldown_expires_on_next_event() {
        let (mut m, t0) = machine();
        m.begin_alarm(t0);
        m.finish_alarm(t0);
        assert_eq!(m.on_sound(true, t0 + 4 * SEC), Step::Unchanged);
        assert_eq!(m.state(), AlarmState::Cooldown);
        // the expiring event itself does not start a new detection
        assert_eq!(m.on_sound(true, t0 + 5 * SEC), Step::CooldownExpired);
        assert_eq!(m.state(), AlarmState::Idle);
        assert_eq!(m.on_sound(true, t0 + 6 * SEC), Step::CryingStarted);
    }

    #[test]
    fn acknowledge_only_in_cooldown() {
        let (mut m, t0) = machine();
        assert!(!m.acknowledge());
        m.on_sound(true, t0);
        assert!(!m.acknowledge());
        assert_eq!(m.state(), AlarmState::Detecting);

        m.begin_alarm(t0);
        assert!(!m.acknowledge());
        m.finish_alarm(t0 + SEC);
        assert!(m.acknowledge());
        assert_eq!(m.state(), AlarmState::Idle);
    }

    #[test]
    fn new_durations_apply_to_running_detection() {
        let (mut m, t0) = machine();
        m.on_sound(true, t0);
        m.set_durations(SEC, SEC);
        assert_eq!(m.on_sound(true, t0 + SEC), Step::Confirmed { elapsed: SEC });
    }

    #[test]
    fn state_survives_u8_snapshot() {
        for state in [AlarmState::Idle, AlarmState::Detecting, AlarmState::Alarming, AlarmState::Cooldown] {
            assert_eq!(AlarmState::from_u8(state.as_u8()), state);
        }
        assert_eq!(serde_json::to_string(&AlarmState::Cooldown).unwrap(), "\"cooldown\"");
        assert_eq!(AlarmState::Detecting.to_string(), "detecting");
    }
}
