use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::AppointmentError;
use crate::store::AppointmentStore;

/// Decides whether a candidate interval collides with an active appointment
/// of the same provider.
pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Check `[start_time, end_time)` against the provider's calendar.
    ///
    /// Only appointments holding their slot (pending-provider-confirmation or
    /// scheduled) count; completed, canceled, no-show, and pending-payment
    /// records never constrain a new booking. `exclude_appointment_id` lets a
    /// transition re-validate an interval while ignoring its own record.
    pub async fn has_conflict(
        &self,
        provider_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<bool, AppointmentError> {
        debug!(
            "Checking conflicts for provider {} from {} to {}",
            provider_id, start_time, end_time
        );

        let existing = self
            .store
            .active_for_provider(provider_id, start_time, end_time)
            .await?;

        let conflicting = existing.iter().any(|apt| {
            if exclude_appointment_id == Some(apt.id) {
                return false;
            }
            intervals_overlap(start_time, end_time, apt.start_time, apt.end_time())
        });

        if conflicting {
            warn!(
                "Conflict detected for provider {} at {}",
                provider_id, start_time
            );
        }

        Ok(conflicting)
    }
}

/// Half-open overlap test: `[s1, e1)` and `[s2, e2)` conflict iff
/// `s1 < e2 && s2 < e1`. Back-to-back intervals do not conflict.
pub fn intervals_overlap(
    start1: DateTime<Utc>,
    end1: DateTime<Utc>,
    start2: DateTime<Utc>,
    end2: DateTime<Utc>,
) -> bool {
    start1 < end2 && start2 < end1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Appointment, AppointmentStatus, SessionType};
    use crate::store::InMemoryAppointmentStore;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    async fn seed(
        store: &InMemoryAppointmentStore,
        provider_id: Uuid,
        start: DateTime<Utc>,
        minutes: i32,
        status: AppointmentStatus,
    ) -> Appointment {
        let appointment = Appointment {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider_id,
            start_time: start,
            duration_minutes: minutes,
            status,
            session_type: SessionType::Video,
            purpose: "consultation".to_string(),
            notes: None,
            provider_confirmation_expires: None,
            cancellation_reason: None,
            payment: None,
            session_summary: None,
            recommendations: Vec::new(),
            follow_up: None,
            created_at: at(0, 0),
            updated_at: at(0, 0),
            version: 0,
        };
        let token = store.provider_token(provider_id).await.unwrap();
        store.insert(appointment, token).await.unwrap()
    }

    #[test]
    fn back_to_back_intervals_do_not_overlap() {
        assert!(!intervals_overlap(at(10, 0), at(10, 30), at(10, 30), at(11, 0)));
        assert!(!intervals_overlap(at(10, 30), at(11, 0), at(10, 0), at(10, 30)));
    }

    #[test]
    fn containment_and_partial_overlap_are_conflicts() {
        assert!(intervals_overlap(at(10, 0), at(11, 0), at(10, 15), at(10, 45)));
        assert!(intervals_overlap(at(10, 0), at(10, 30), at(10, 15), at(10, 45)));
    }

    #[tokio::test]
    async fn scheduled_appointment_blocks_overlapping_candidate() {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let provider_id = Uuid::new_v4();
        seed(&store, provider_id, at(10, 0), 30, AppointmentStatus::Scheduled).await;

        let service = ConflictDetectionService::new(store);
        assert!(service
            .has_conflict(provider_id, at(10, 15), at(10, 45), None)
            .await
            .unwrap());
        assert!(!service
            .has_conflict(provider_id, at(10, 30), at(11, 0), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn non_blocking_statuses_never_conflict() {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let provider_id = Uuid::new_v4();
        seed(&store, provider_id, at(10, 0), 30, AppointmentStatus::PendingPayment).await;
        seed(&store, provider_id, at(11, 0), 30, AppointmentStatus::Canceled).await;
        seed(&store, provider_id, at(12, 0), 30, AppointmentStatus::Completed).await;

        let service = ConflictDetectionService::new(store);
        for start in [at(10, 0), at(11, 0), at(12, 0)] {
            assert!(!service
                .has_conflict(provider_id, start, start + Duration::minutes(30), None)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn exclusion_ignores_the_record_being_moved() {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let provider_id = Uuid::new_v4();
        let existing = seed(&store, provider_id, at(10, 0), 30, AppointmentStatus::Scheduled).await;

        let service = ConflictDetectionService::new(store);
        assert!(!service
            .has_conflict(provider_id, at(10, 0), at(10, 30), Some(existing.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn other_providers_do_not_interfere() {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let provider_id = Uuid::new_v4();
        seed(&store, Uuid::new_v4(), at(10, 0), 30, AppointmentStatus::Scheduled).await;

        let service = ConflictDetectionService::new(store);
        assert!(!service
            .has_conflict(provider_id, at(10, 0), at(10, 30), None)
            .await
            .unwrap());
    }
}
