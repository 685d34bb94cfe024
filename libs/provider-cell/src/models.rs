use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==============================================================================
// PROVIDER SCHEDULE MODELS
// ==============================================================================

/// One working window within a day, local time of day as "HH:MM".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }
}

/// Recurring availability for a single weekday.
///
/// `day_of_week` follows the provider profile convention: Monday = 1 through
/// Sunday = 7. Ranges are ordered and disjoint; that invariant is maintained
/// by the profile editor, not re-validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayAvailability {
    pub day_of_week: u32,
    pub is_available: bool,
    pub time_ranges: Vec<TimeRange>,
}

impl DayAvailability {
    pub fn unavailable(day_of_week: u32) -> Self {
        Self {
            day_of_week,
            is_available: false,
            time_ranges: Vec::new(),
        }
    }
}

/// A provider's full recurring weekly schedule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WeeklySchedule {
    pub days: Vec<DayAvailability>,
}

impl WeeklySchedule {
    pub fn day(&self, day_of_week: u32) -> Option<&DayAvailability> {
        self.days.iter().find(|d| d.day_of_week == day_of_week)
    }
}

// ==============================================================================
// SLOT MODELS
// ==============================================================================

/// A bookable candidate interval, half-open `[start_time, end_time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailableSlot {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// An interval already held by an active appointment, passed in by the
/// caller so slot computation stays a pure function of its inputs.
#[derive(Debug, Clone, Copy)]
pub struct BookedInterval {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AvailabilityError {
    /// The provider calendar itself is broken. Operator-facing: surfaces to
    /// whoever maintains the provider profile, never as a client-side retry.
    #[error("Provider schedule misconfigured: {0}")]
    Config(String),

    #[error("Schedule storage error: {0}")]
    Storage(String),
}
