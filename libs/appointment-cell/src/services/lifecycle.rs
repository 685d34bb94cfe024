// libs/appointment-cell/src/services/lifecycle.rs
use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{debug, warn};

use provider_cell::models::WeeklySchedule;
use provider_cell::services::AvailabilityService;

use crate::models::{Appointment, AppointmentError, AppointmentStatus, SchedulingRules};

/// The appointment state machine: which transitions exist, plus the guard
/// and deadline rules layered on top of the table.
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed.
    pub fn validate_status_transition(
        &self,
        current_status: &AppointmentStatus,
        new_status: &AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        let valid_transitions = self.get_valid_transitions(current_status);

        if !valid_transitions.contains(new_status) {
            warn!(
                "Invalid status transition attempted: {} -> {}",
                current_status, new_status
            );
            return Err(AppointmentError::InvalidTransition {
                from: *current_status,
                to: *new_status,
            });
        }

        debug!("Status transition validated: {} -> {}", current_status, new_status);
        Ok(())
    }

    /// All valid next statuses for a given current status.
    pub fn get_valid_transitions(&self, current_status: &AppointmentStatus) -> Vec<AppointmentStatus> {
        match current_status {
            // Payment success claims the slot directly; expiry or an explicit
            // actor cancels.
            AppointmentStatus::PendingPayment => vec![
                AppointmentStatus::Scheduled,
                AppointmentStatus::Canceled,
            ],
            AppointmentStatus::PendingProviderConfirmation => vec![
                AppointmentStatus::Scheduled,
                AppointmentStatus::Canceled,
            ],
            AppointmentStatus::Scheduled => vec![
                AppointmentStatus::Completed,
                AppointmentStatus::Canceled,
                AppointmentStatus::NoShow,
            ],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed => vec![],
            AppointmentStatus::Canceled => vec![],
            AppointmentStatus::NoShow => vec![],
        }
    }

    /// Guard for `confirm()`: a confirmation attempted past the deadline must
    /// not go through; the caller runs the expiry cascade instead.
    pub fn ensure_confirmable(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        match appointment.provider_confirmation_expires {
            Some(deadline) if now > deadline => Err(AppointmentError::DeadlineExpired),
            _ => Ok(()),
        }
    }

    /// Validate the timing constraints of a booking request.
    pub fn validate_booking_request(
        &self,
        start_time: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
        rules: &SchedulingRules,
    ) -> Result<(), AppointmentError> {
        if duration_minutes < rules.min_duration_minutes
            || duration_minutes > rules.max_duration_minutes
            || duration_minutes % rules.duration_step_minutes != 0
        {
            return Err(AppointmentError::Validation(format!(
                "Duration must be a multiple of {} minutes between {} and {}",
                rules.duration_step_minutes, rules.min_duration_minutes, rules.max_duration_minutes
            )));
        }

        if start_time <= now {
            return Err(AppointmentError::Validation(
                "Appointment must be scheduled for a future time".to_string(),
            ));
        }

        Ok(())
    }

    /// Deadline for a new pending-provider-confirmation appointment.
    ///
    /// One confirmation window after the provider's configured start of day
    /// on the appointment's own date. When the appointment starts less than
    /// the collapse window away (or the weekday has no usable start of day),
    /// the deadline collapses to one window from now, so a provider is never
    /// handed a confirmation window that outlives the appointment itself.
    pub fn confirmation_deadline(
        &self,
        schedule: &WeeklySchedule,
        availability: &AvailabilityService,
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
        rules: &SchedulingRules,
    ) -> Result<DateTime<Utc>, AppointmentError> {
        let window = Duration::minutes(rules.confirmation_window_minutes);

        if start_time - now < Duration::hours(rules.confirmation_collapse_hours) {
            return Ok(now + window);
        }

        let day_of_week = start_time.date_naive().weekday().number_from_monday();
        match availability.first_range_start(schedule, day_of_week)? {
            Some(day_start) => Ok(start_time.date_naive().and_time(day_start).and_utc() + window),
            None => Ok(now + window),
        }
    }
}

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{NaiveTime, TimeZone};
    use provider_cell::models::{DayAvailability, TimeRange};

    fn service() -> AppointmentLifecycleService {
        AppointmentLifecycleService::new()
    }

    #[test]
    fn transition_table_matches_the_state_machine() {
        let lifecycle = service();
        let cases = [
            (AppointmentStatus::PendingPayment, AppointmentStatus::Scheduled, true),
            (AppointmentStatus::PendingPayment, AppointmentStatus::Canceled, true),
            (AppointmentStatus::PendingPayment, AppointmentStatus::Completed, false),
            (AppointmentStatus::PendingPayment, AppointmentStatus::NoShow, false),
            (
                AppointmentStatus::PendingProviderConfirmation,
                AppointmentStatus::Scheduled,
                true,
            ),
            (
                AppointmentStatus::PendingProviderConfirmation,
                AppointmentStatus::Canceled,
                true,
            ),
            (
                AppointmentStatus::PendingProviderConfirmation,
                AppointmentStatus::Completed,
                false,
            ),
            (AppointmentStatus::Scheduled, AppointmentStatus::Completed, true),
            (AppointmentStatus::Scheduled, AppointmentStatus::Canceled, true),
            (AppointmentStatus::Scheduled, AppointmentStatus::NoShow, true),
            (AppointmentStatus::Scheduled, AppointmentStatus::PendingPayment, false),
            (AppointmentStatus::Completed, AppointmentStatus::Canceled, false),
            (AppointmentStatus::Canceled, AppointmentStatus::Scheduled, false),
            (AppointmentStatus::NoShow, AppointmentStatus::Completed, false),
        ];

        for (from, to, allowed) in cases {
            let result = lifecycle.validate_status_transition(&from, &to);
            if allowed {
                assert!(result.is_ok(), "{} -> {} should be allowed", from, to);
            } else {
                assert_matches!(
                    result,
                    Err(AppointmentError::InvalidTransition { .. }),
                    "{} -> {} should be rejected",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        let lifecycle = service();
        for status in [
            AppointmentStatus::Completed,
            AppointmentStatus::Canceled,
            AppointmentStatus::NoShow,
        ] {
            assert!(lifecycle.get_valid_transitions(&status).is_empty());
        }
    }

    #[test]
    fn duration_must_step_by_fifteen_within_bounds() {
        let lifecycle = service();
        let rules = SchedulingRules::default();
        let now = Utc::now();
        let start = now + Duration::days(2);

        assert!(lifecycle.validate_booking_request(start, 45, now, &rules).is_ok());
        assert_matches!(
            lifecycle.validate_booking_request(start, 20, now, &rules),
            Err(AppointmentError::Validation(_))
        );
        assert_matches!(
            lifecycle.validate_booking_request(start, 0, now, &rules),
            Err(AppointmentError::Validation(_))
        );
        assert_matches!(
            lifecycle.validate_booking_request(start, 135, now, &rules),
            Err(AppointmentError::Validation(_))
        );
    }

    #[test]
    fn start_must_be_strictly_in_the_future() {
        let lifecycle = service();
        let rules = SchedulingRules::default();
        let now = Utc::now();

        assert_matches!(
            lifecycle.validate_booking_request(now, 30, now, &rules),
            Err(AppointmentError::Validation(_))
        );
        assert_matches!(
            lifecycle.validate_booking_request(now - Duration::minutes(1), 30, now, &rules),
            Err(AppointmentError::Validation(_))
        );
    }

    fn monday_schedule() -> WeeklySchedule {
        WeeklySchedule {
            days: vec![DayAvailability {
                day_of_week: 1,
                is_available: true,
                time_ranges: vec![TimeRange::new("09:00", "17:00")],
            }],
        }
    }

    #[test]
    fn deadline_is_one_hour_after_start_of_workday() {
        let lifecycle = service();
        let availability = AvailabilityService::new(30);
        let rules = SchedulingRules::default();

        // Booked on a Thursday for the following Monday at 14:00.
        let now = Utc.with_ymd_and_hms(2025, 5, 29, 12, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();

        let deadline = lifecycle
            .confirmation_deadline(&monday_schedule(), &availability, start, now, &rules)
            .unwrap();

        assert_eq!(deadline, Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap());
    }

    #[test]
    fn deadline_collapses_for_short_notice_bookings() {
        let lifecycle = service();
        let availability = AvailabilityService::new(30);
        let rules = SchedulingRules::default();

        // Appointment in two hours: the workday-based deadline would outlive
        // the appointment.
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        let start = now + Duration::hours(2);

        let deadline = lifecycle
            .confirmation_deadline(&monday_schedule(), &availability, start, now, &rules)
            .unwrap();

        assert_eq!(deadline, now + Duration::hours(1));
    }

    #[test]
    fn deadline_falls_back_when_day_has_no_working_hours() {
        let lifecycle = service();
        let availability = AvailabilityService::new(30);
        let rules = SchedulingRules::default();

        let now = Utc.with_ymd_and_hms(2025, 5, 29, 12, 0, 0).unwrap();
        // Following Wednesday: not configured in the schedule at all.
        let start = Utc.with_ymd_and_hms(2025, 6, 4, 14, 0, 0).unwrap();

        let deadline = lifecycle
            .confirmation_deadline(&monday_schedule(), &availability, start, now, &rules)
            .unwrap();

        assert_eq!(deadline, now + Duration::hours(1));
    }

    #[test]
    fn deadline_honors_the_configured_day_start() {
        let lifecycle = service();
        let availability = AvailabilityService::new(30);
        let rules = SchedulingRules::default();

        let schedule = WeeklySchedule {
            days: vec![DayAvailability {
                day_of_week: 1,
                is_available: true,
                time_ranges: vec![TimeRange::new("13:30", "18:00")],
            }],
        };
        assert_eq!(
            availability.first_range_start(&schedule, 1).unwrap(),
            Some(NaiveTime::from_hms_opt(13, 30, 0).unwrap())
        );

        let now = Utc.with_ymd_and_hms(2025, 5, 29, 12, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();

        let deadline = lifecycle
            .confirmation_deadline(&schedule, &availability, start, now, &rules)
            .unwrap();

        assert_eq!(deadline, Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap());
    }

    #[test]
    fn lapsed_deadline_is_not_confirmable() {
        let lifecycle = service();
        let now = Utc::now();
        let appointment = Appointment {
            id: uuid::Uuid::new_v4(),
            client_id: uuid::Uuid::new_v4(),
            provider_id: uuid::Uuid::new_v4(),
            start_time: now + Duration::hours(4),
            duration_minutes: 30,
            status: AppointmentStatus::PendingProviderConfirmation,
            session_type: crate::models::SessionType::Video,
            purpose: "consultation".to_string(),
            notes: None,
            provider_confirmation_expires: Some(now - Duration::minutes(1)),
            cancellation_reason: None,
            payment: None,
            session_summary: None,
            recommendations: Vec::new(),
            follow_up: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        assert_matches!(
            lifecycle.ensure_confirmable(&appointment, now),
            Err(AppointmentError::DeadlineExpired)
        );

        let mut fresh = appointment;
        fresh.provider_confirmation_expires = Some(now + Duration::minutes(30));
        assert!(lifecycle.ensure_confirmable(&fresh, now).is_ok());
    }
}
