mod manager;
mod state;

pub use manager::{AlarmEvent, AlarmManager};
pub use state::{AlarmState, AlarmStateMachine, Step};
