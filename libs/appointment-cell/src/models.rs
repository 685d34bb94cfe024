// libs/appointment-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use provider_cell::models::AvailabilityError;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    pub session_type: SessionType,
    pub purpose: String,
    pub notes: Option<String>,
    pub provider_confirmation_expires: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub payment: Option<PaymentInfo>,
    pub session_summary: Option<String>,
    pub recommendations: Vec<Recommendation>,
    pub follow_up: Option<FollowUp>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped by the store on every write.
    pub version: u64,
}

impl Appointment {
    /// End of the session. Always derived; never settable on its own.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + chrono::Duration::minutes(self.duration_minutes as i64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentStatus {
    PendingPayment,
    PendingProviderConfirmation,
    Scheduled,
    Completed,
    Canceled,
    NoShow,
}

impl AppointmentStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Canceled | AppointmentStatus::NoShow
        )
    }

    /// Whether an appointment in this status holds its slot on the
    /// provider's calendar. Pending-payment bookings do not: the slot is
    /// only claimed once the payment succeeds.
    pub fn blocks_calendar(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::PendingProviderConfirmation | AppointmentStatus::Scheduled
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::PendingPayment => write!(f, "pending-payment"),
            AppointmentStatus::PendingProviderConfirmation => {
                write!(f, "pending-provider-confirmation")
            }
            AppointmentStatus::Scheduled => write!(f, "scheduled"),
            AppointmentStatus::Completed => write!(f, "completed"),
            AppointmentStatus::Canceled => write!(f, "canceled"),
            AppointmentStatus::NoShow => write!(f, "no-show"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Video,
    Audio,
    Chat,
}

// ==============================================================================
// PAYMENT AND ANNOTATION MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub amount: f64,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
}

impl PaymentInfo {
    pub fn is_refundable(&self) -> bool {
        self.status == PaymentStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub description: Option<String>,
    pub kind: String,
    pub priority: RecommendationPriority,
    pub due_date: Option<DateTime<Utc>>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub recommended: bool,
    pub date: DateTime<Utc>,
    pub notes: Option<String>,
    pub recommended_appointment_id: Option<Uuid>,
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub session_type: SessionType,
    pub purpose: String,
    pub notes: Option<String>,
    /// Session fee resolved by the calling layer from the provider profile.
    pub fee_amount: f64,
}

/// Who is asking for a cancellation. Client and provider cancellations are
/// authorized against the appointment parties; the system actor covers the
/// expiry sweepers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelActor {
    Client(Uuid),
    Provider(Uuid),
    System,
}

/// Result of a confirmation attempt. A confirm past the deadline is not a
/// bare failure: the appointment is canceled (with refund and notification)
/// and the canceled record is handed back.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Confirmed(Appointment),
    DeadlineExpired(Appointment),
}

// ==============================================================================
// SCHEDULING RULES
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SchedulingRules {
    pub min_duration_minutes: i32,
    pub max_duration_minutes: i32,
    pub duration_step_minutes: i32,
    pub confirmation_window_minutes: i64,
    pub confirmation_collapse_hours: i64,
    pub payment_window_hours: i64,
    pub max_booking_attempts: u32,
}

impl Default for SchedulingRules {
    fn default() -> Self {
        Self {
            min_duration_minutes: 15,
            max_duration_minutes: 120,
            duration_step_minutes: 15,
            confirmation_window_minutes: 60,  // provider gets one hour past start of day
            confirmation_collapse_hours: 24,  // short-notice bookings collapse to now + window
            payment_window_hours: 24,
            max_booking_attempts: 3,
        }
    }
}

impl SchedulingRules {
    pub fn from_config(config: &shared_config::AppConfig) -> Self {
        Self {
            confirmation_window_minutes: config.confirmation_window_minutes,
            confirmation_collapse_hours: config.confirmation_collapse_hours,
            payment_window_hours: config.payment_window_hours,
            max_booking_attempts: config.max_booking_attempts,
            ..Self::default()
        }
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Appointment slot not available")]
    SlotUnavailable,

    #[error("Cannot change status from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Confirmation deadline has passed")]
    DeadlineExpired,

    #[error("Unauthorized access to appointment")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider schedule misconfigured: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<AvailabilityError> for AppointmentError {
    fn from(err: AvailabilityError) -> Self {
        match err {
            AvailabilityError::Config(msg) => AppointmentError::Config(msg),
            AvailabilityError::Storage(msg) => AppointmentError::Storage(msg),
        }
    }
}
