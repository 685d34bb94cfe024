pub mod conflict;
pub mod external;
pub mod lifecycle;
pub mod scheduling;

pub use conflict::ConflictDetectionService;
pub use external::{
    ExternalCallError, Ledger, NotificationKind, Notifier, RecordingLedger, RecordingNotifier,
    RetryPolicy, SideEffectDispatcher,
};
pub use lifecycle::AppointmentLifecycleService;
pub use scheduling::SchedulingService;
