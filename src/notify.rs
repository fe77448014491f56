pub mod dispatcher;
pub mod notifier;

pub use dispatcher::{DetectionEvent, EventType, Metadata, NotificationChannel, NotificationDispatcher};
pub use notifier::AlarmNotifier;
