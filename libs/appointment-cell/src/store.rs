// libs/appointment-cell/src/store.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Appointment, AppointmentError, AppointmentStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Appointment not found")]
    NotFound,

    /// The record changed since it was read. Callers re-read and re-apply;
    /// exactly one of two racing writers wins.
    #[error("Appointment record version conflict")]
    VersionConflict,

    /// The provider's calendar changed since the booking token was read,
    /// invalidating the conflict check performed under that token.
    #[error("Provider booking token conflict")]
    TokenConflict,

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for AppointmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppointmentError::NotFound,
            other => AppointmentError::Storage(other.to_string()),
        }
    }
}

/// Persistence seam for appointments.
///
/// The backing engine is only assumed to offer per-record conditional writes,
/// not multi-record transactions. Atomic booking is built on a per-provider
/// booking token: read the token, run the conflict check, then write with the
/// token. Any interleaved write to that provider's calendar bumps the token
/// and fails the guarded write. Records are never physically deleted;
/// terminal appointments stay behind for audit and history.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Current booking token for a provider's calendar.
    async fn provider_token(&self, provider_id: Uuid) -> Result<u64, StoreError>;

    /// Insert a new appointment, guarded by the booking token observed
    /// before the caller's conflict check.
    async fn insert(&self, appointment: Appointment, token: u64) -> Result<Appointment, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Conditional write on `appointment.version`; the stored copy comes
    /// back with the version bumped.
    async fn update(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    /// Conditional write on both the record version and the provider booking
    /// token. Used by transitions that claim a calendar slot the record did
    /// not previously hold.
    async fn update_with_token(
        &self,
        appointment: Appointment,
        token: u64,
    ) -> Result<Appointment, StoreError>;

    /// Calendar-blocking appointments of a provider whose interval
    /// intersects `[from, to)`.
    async fn active_for_provider(
        &self,
        provider_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Pending-provider-confirmation appointments whose deadline is at or
    /// before `now`.
    async fn confirmation_expired(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError>;

    /// Pending-payment appointments created at or before `cutoff`.
    async fn payment_window_elapsed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Scheduled appointments whose end time is at or before `now`.
    async fn session_ended(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError>;
}

// ==============================================================================
// IN-MEMORY IMPLEMENTATION
// ==============================================================================

#[derive(Default)]
struct StoreInner {
    appointments: HashMap<Uuid, Appointment>,
    provider_tokens: HashMap<Uuid, u64>,
}

impl StoreInner {
    fn bump_token(&mut self, provider_id: Uuid) {
        *self.provider_tokens.entry(provider_id).or_insert(0) += 1;
    }
}

/// Store used by tests and embedding callers. A single lock serializes
/// writes, which trivially satisfies the per-provider ordering the trait
/// demands; the token protocol is still honored so callers behave
/// identically against a sharded backend.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn provider_token(&self, provider_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.provider_tokens.get(&provider_id).copied().unwrap_or(0))
    }

    async fn insert(&self, appointment: Appointment, token: u64) -> Result<Appointment, StoreError> {
        let mut inner = self.inner.write().await;

        let current = inner
            .provider_tokens
            .get(&appointment.provider_id)
            .copied()
            .unwrap_or(0);
        if current != token {
            return Err(StoreError::TokenConflict);
        }

        let mut stored = appointment;
        stored.version = 1;
        inner.bump_token(stored.provider_id);
        inner.appointments.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.inner.read().await.appointments.get(&id).cloned())
    }

    async fn update(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        let mut inner = self.inner.write().await;

        let existing = inner
            .appointments
            .get(&appointment.id)
            .ok_or(StoreError::NotFound)?;
        if existing.version != appointment.version {
            return Err(StoreError::VersionConflict);
        }

        let mut stored = appointment;
        stored.version += 1;
        inner.bump_token(stored.provider_id);
        inner.appointments.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_with_token(
        &self,
        appointment: Appointment,
        token: u64,
    ) -> Result<Appointment, StoreError> {
        let mut inner = self.inner.write().await;

        let current = inner
            .provider_tokens
            .get(&appointment.provider_id)
            .copied()
            .unwrap_or(0);
        if current != token {
            return Err(StoreError::TokenConflict);
        }

        let existing = inner
            .appointments
            .get(&appointment.id)
            .ok_or(StoreError::NotFound)?;
        if existing.version != appointment.version {
            return Err(StoreError::VersionConflict);
        }

        let mut stored = appointment;
        stored.version += 1;
        inner.bump_token(stored.provider_id);
        inner.appointments.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn active_for_provider(
        &self,
        provider_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|apt| {
                apt.provider_id == provider_id
                    && apt.status.blocks_calendar()
                    && apt.start_time < to
                    && apt.end_time() > from
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(matches)
    }

    async fn confirmation_expired(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|apt| {
                apt.status == AppointmentStatus::PendingProviderConfirmation
                    && apt.provider_confirmation_expires.map_or(false, |d| d <= now)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.provider_confirmation_expires
                .cmp(&b.provider_confirmation_expires)
        });
        Ok(matches)
    }

    async fn payment_window_elapsed(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|apt| {
                apt.status == AppointmentStatus::PendingPayment && apt.created_at <= cutoff
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn session_ended(&self, now: DateTime<Utc>) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|apt| apt.status == AppointmentStatus::Scheduled && apt.end_time() <= now)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionType;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn appointment(provider_id: Uuid, status: AppointmentStatus) -> Appointment {
        let now = Utc::now();
        Appointment {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider_id,
            start_time: now + Duration::hours(48),
            duration_minutes: 30,
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
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn insert_with_stale_token_is_rejected() {
        let store = InMemoryAppointmentStore::new();
        let provider_id = Uuid::new_v4();

        let token = store.provider_token(provider_id).await.unwrap();
        store
            .insert(appointment(provider_id, AppointmentStatus::Scheduled), token)
            .await
            .unwrap();

        // Same token again: the first insert bumped it.
        let result = store
            .insert(appointment(provider_id, AppointmentStatus::Scheduled), token)
            .await;
        assert_matches!(result, Err(StoreError::TokenConflict));
    }

    #[tokio::test]
    async fn update_with_stale_version_is_rejected() {
        let store = InMemoryAppointmentStore::new();
        let provider_id = Uuid::new_v4();

        let token = store.provider_token(provider_id).await.unwrap();
        let stored = store
            .insert(appointment(provider_id, AppointmentStatus::Scheduled), token)
            .await
            .unwrap();

        let mut first = stored.clone();
        first.session_summary = Some("first writer".to_string());
        store.update(first).await.unwrap();

        let mut second = stored;
        second.session_summary = Some("second writer".to_string());
        assert_matches!(store.update(second).await, Err(StoreError::VersionConflict));
    }

    #[tokio::test]
    async fn active_scan_ignores_non_blocking_statuses() {
        let store = InMemoryAppointmentStore::new();
        let provider_id = Uuid::new_v4();

        for (i, status) in [
            AppointmentStatus::PendingPayment,
            AppointmentStatus::PendingProviderConfirmation,
            AppointmentStatus::Scheduled,
            AppointmentStatus::Canceled,
            AppointmentStatus::Completed,
        ]
        .into_iter()
        .enumerate()
        {
            let mut apt = appointment(provider_id, status);
            apt.start_time += Duration::hours(i as i64);
            let token = store.provider_token(provider_id).await.unwrap();
            store.insert(apt, token).await.unwrap();
        }

        let now = Utc::now();
        let active = store
            .active_for_provider(provider_id, now, now + Duration::days(7))
            .await
            .unwrap();

        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|apt| apt.status.blocks_calendar()));
    }

    #[tokio::test]
    async fn confirmation_scan_matches_lapsed_deadlines_only() {
        let store = InMemoryAppointmentStore::new();
        let provider_id = Uuid::new_v4();
        let now = Utc::now();

        let mut overdue = appointment(provider_id, AppointmentStatus::PendingProviderConfirmation);
        overdue.provider_confirmation_expires = Some(now - Duration::minutes(5));
        let mut fresh = appointment(provider_id, AppointmentStatus::PendingProviderConfirmation);
        fresh.provider_confirmation_expires = Some(now + Duration::hours(5));

        let token = store.provider_token(provider_id).await.unwrap();
        let overdue = store.insert(overdue, token).await.unwrap();
        let token = store.provider_token(provider_id).await.unwrap();
        store.insert(fresh, token).await.unwrap();

        let expired = store.confirmation_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
    }
}
