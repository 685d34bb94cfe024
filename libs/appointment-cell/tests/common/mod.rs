use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use appointment_cell::models::{BookAppointmentRequest, SessionType};
use appointment_cell::services::{RecordingLedger, RecordingNotifier};
use appointment_cell::store::{AppointmentStore, InMemoryAppointmentStore};
use appointment_cell::SchedulingService;
use provider_cell::models::{DayAvailability, TimeRange, WeeklySchedule};
use provider_cell::services::{InMemoryScheduleRepository, ScheduleRepository};
use shared_config::{AppConfig, BookingPolicy};
use shared_utils::clock::Clock;
use shared_utils::test_utils::ManualClock;

/// Weekdays 09:00-18:00, weekend off.
pub fn weekday_schedule() -> WeeklySchedule {
    WeeklySchedule {
        days: (1..=7)
            .map(|day_of_week| {
                if day_of_week <= 5 {
                    DayAvailability {
                        day_of_week,
                        is_available: true,
                        time_ranges: vec![TimeRange::new("09:00", "18:00")],
                    }
                } else {
                    DayAvailability::unavailable(day_of_week)
                }
            })
            .collect(),
    }
}

pub struct TestHarness {
    pub service: Arc<SchedulingService>,
    pub store: Arc<InMemoryAppointmentStore>,
    pub schedules: Arc<InMemoryScheduleRepository>,
    pub ledger: Arc<RecordingLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub provider_id: Uuid,
    pub client_id: Uuid,
}

impl TestHarness {
    pub async fn new(policy: BookingPolicy) -> Self {
        let config = AppConfig {
            booking_policy: policy,
            side_effect_retry_backoff_ms: 10,
            ..AppConfig::default()
        };

        let store = Arc::new(InMemoryAppointmentStore::new());
        let schedules = Arc::new(InMemoryScheduleRepository::new());
        let ledger = Arc::new(RecordingLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        // 2025-06-02 08:00 UTC, a Monday.
        let clock = Arc::new(ManualClock::monday_morning());

        let service = Arc::new(SchedulingService::new(
            Arc::clone(&store) as Arc<dyn AppointmentStore>,
            Arc::clone(&schedules) as Arc<dyn ScheduleRepository>,
            Arc::clone(&ledger) as _,
            Arc::clone(&notifier) as _,
            Arc::clone(&clock) as Arc<dyn Clock>,
            &config,
        ));

        let provider_id = Uuid::new_v4();
        schedules.upsert(provider_id, weekday_schedule()).await;

        Self {
            service,
            store,
            schedules,
            ledger,
            notifier,
            clock,
            provider_id,
            client_id: Uuid::new_v4(),
        }
    }

    pub fn monday_at(&self, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    pub fn next_monday_at(&self, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 9, hour, minute, 0).unwrap()
    }

    pub fn request(&self, start_time: DateTime<Utc>, duration_minutes: i32) -> BookAppointmentRequest {
        BookAppointmentRequest {
            client_id: self.client_id,
            provider_id: self.provider_id,
            start_time,
            duration_minutes,
            session_type: SessionType::Video,
            purpose: "consultation".to_string(),
            notes: None,
            fee_amount: 75.0,
        }
    }
}

/// Let dispatched background side effects (refunds, notifications) drain.
pub async fn drain_side_effects() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
