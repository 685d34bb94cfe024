// libs/appointment-cell/src/services/scheduling.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use provider_cell::models::{AvailableSlot, BookedInterval};
use provider_cell::services::{AvailabilityService, ScheduleRepository};
use shared_config::{AppConfig, BookingPolicy};
use shared_utils::Clock;

use crate::models::{
    Appointment, AppointmentError, AppointmentStatus, BookAppointmentRequest, CancelActor,
    ConfirmOutcome, FollowUp, PaymentInfo, PaymentStatus, Recommendation, SchedulingRules,
};
use crate::services::conflict::ConflictDetectionService;
use crate::services::external::{
    Ledger, NotificationKind, Notifier, RetryPolicy, SideEffectDispatcher,
};
use crate::services::lifecycle::AppointmentLifecycleService;
use crate::store::{AppointmentStore, StoreError};

/// Orchestration façade over the appointment engine.
///
/// Every mutation, user-triggered or sweeper-triggered, funnels through the
/// transition methods here, so the status re-check under the record's version
/// token is applied uniformly: two racing writers produce exactly one winning
/// transition, never a double-applied cascade.
pub struct SchedulingService {
    store: Arc<dyn AppointmentStore>,
    schedules: Arc<dyn ScheduleRepository>,
    conflict_service: ConflictDetectionService,
    lifecycle_service: AppointmentLifecycleService,
    availability_service: AvailabilityService,
    dispatcher: SideEffectDispatcher,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
    rules: SchedulingRules,
}

/// What a transition closure decided about the record it was handed.
enum StepOutcome {
    /// Write this mutated record back (conditionally, on its version).
    Write(Appointment),
    /// Nothing to do: the transition was already applied, or the guard no
    /// longer matches. Hand the current record back unchanged.
    Skip(Appointment),
}

struct Applied {
    appointment: Appointment,
    changed: bool,
}

impl SchedulingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        schedules: Arc<dyn ScheduleRepository>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        let conflict_service = ConflictDetectionService::new(Arc::clone(&store));
        let dispatcher = SideEffectDispatcher::new(
            ledger,
            notifier,
            RetryPolicy {
                attempts: config.side_effect_retry_attempts,
                backoff_ms: config.side_effect_retry_backoff_ms,
            },
        );

        Self {
            conflict_service,
            lifecycle_service: AppointmentLifecycleService::new(),
            availability_service: AvailabilityService::new(config.slot_stride_minutes),
            dispatcher,
            store,
            schedules,
            clock,
            policy: config.booking_policy,
            rules: SchedulingRules::from_config(config),
        }
    }

    // ==========================================================================
    // QUERIES
    // ==========================================================================

    pub async fn get(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store
            .get(appointment_id)
            .await?
            .ok_or(AppointmentError::NotFound)
    }

    /// Bookable slots for a provider on a date.
    pub async fn available_slots(
        &self,
        provider_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<AvailableSlot>, AppointmentError> {
        let schedule = self
            .schedules
            .weekly_schedule(provider_id)
            .await?
            .ok_or(AppointmentError::NotFound)?;

        let day_start = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let day_end = day_start + Duration::days(1);
        let active = self
            .store
            .active_for_provider(provider_id, day_start, day_end)
            .await?;
        let booked: Vec<BookedInterval> = active
            .iter()
            .map(|apt| BookedInterval {
                start_time: apt.start_time,
                end_time: apt.end_time(),
            })
            .collect();

        let slots =
            self.availability_service
                .available_slots(&schedule, date, &booked, self.clock.now())?;
        Ok(slots)
    }

    // ==========================================================================
    // BOOKING
    // ==========================================================================

    /// Create a new appointment.
    ///
    /// The conflict check and the insert form one logical unit: both run
    /// under a per-provider booking token, and the insert fails if any other
    /// write touched the provider's calendar in between. Losing the race
    /// surfaces as `SlotUnavailable`; the caller re-queries availability.
    pub async fn book(
        &self,
        request: BookAppointmentRequest,
    ) -> Result<Appointment, AppointmentError> {
        info!(
            "Booking appointment for client {} with provider {} at {}",
            request.client_id, request.provider_id, request.start_time
        );

        let now = self.clock.now();
        self.lifecycle_service.validate_booking_request(
            request.start_time,
            request.duration_minutes,
            now,
            &self.rules,
        )?;

        let schedule = self
            .schedules
            .weekly_schedule(request.provider_id)
            .await?
            .ok_or(AppointmentError::NotFound)?;

        let end_time = request.start_time + Duration::minutes(request.duration_minutes as i64);

        // Cheap pre-check before any payment is captured.
        if self
            .conflict_service
            .has_conflict(request.provider_id, request.start_time, end_time, None)
            .await?
        {
            return Err(AppointmentError::SlotUnavailable);
        }

        let (status, deadline, payment) = match self.policy {
            BookingPolicy::ConfirmationFirst => {
                let reference = self
                    .dispatcher
                    .charge(request.fee_amount, request.client_id)
                    .await?;
                let deadline = self.lifecycle_service.confirmation_deadline(
                    &schedule,
                    &self.availability_service,
                    request.start_time,
                    now,
                    &self.rules,
                )?;
                (
                    AppointmentStatus::PendingProviderConfirmation,
                    Some(deadline),
                    PaymentInfo {
                        amount: request.fee_amount,
                        status: PaymentStatus::Completed,
                        transaction_id: Some(reference),
                    },
                )
            }
            BookingPolicy::PaymentFirst => (
                AppointmentStatus::PendingPayment,
                None,
                PaymentInfo {
                    amount: request.fee_amount,
                    status: PaymentStatus::Pending,
                    transaction_id: None,
                },
            ),
        };

        let appointment = Appointment {
            id: Uuid::new_v4(),
            client_id: request.client_id,
            provider_id: request.provider_id,
            start_time: request.start_time,
            duration_minutes: request.duration_minutes,
            status,
            session_type: request.session_type,
            purpose: request.purpose,
            notes: request.notes,
            provider_confirmation_expires: deadline,
            cancellation_reason: None,
            payment: Some(payment),
            session_summary: None,
            recommendations: Vec::new(),
            follow_up: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        match self.insert_new(appointment.clone(), true).await {
            Ok(stored) => {
                info!(
                    "Appointment {} booked with provider {} ({})",
                    stored.id, stored.provider_id, stored.status
                );
                self.dispatcher.dispatch_notification(
                    NotificationKind::Booked,
                    stored.id,
                    vec![stored.client_id, stored.provider_id],
                );
                Ok(stored)
            }
            Err(e) => {
                // The charge, if any, is released; the booking never existed.
                self.release_payment(&appointment);
                Err(e)
            }
        }
    }

    /// Token-guarded insert with bounded retry. `enforce_slot` re-runs the
    /// conflict check under each fresh token; pending-payment records that
    /// hold no slot skip it.
    async fn insert_new(
        &self,
        appointment: Appointment,
        enforce_slot: bool,
    ) -> Result<Appointment, AppointmentError> {
        let provider_id = appointment.provider_id;
        let start_time = appointment.start_time;
        let end_time = appointment.end_time();

        for attempt in 1..=self.rules.max_booking_attempts {
            let token = self.store.provider_token(provider_id).await?;

            if enforce_slot
                && self
                    .conflict_service
                    .has_conflict(provider_id, start_time, end_time, None)
                    .await?
            {
                warn!(
                    "Appointment conflict detected for provider {} at {}",
                    provider_id, start_time
                );
                return Err(AppointmentError::SlotUnavailable);
            }

            match self.store.insert(appointment.clone(), token).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::TokenConflict) => {
                    debug!(
                        "Booking token moved for provider {} (attempt {}/{})",
                        provider_id, attempt, self.rules.max_booking_attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppointmentError::SlotUnavailable)
    }

    // ==========================================================================
    // USER TRANSITIONS
    // ==========================================================================

    /// Provider accepts a pending appointment.
    ///
    /// Past the deadline this does not confirm: the same cancel-with-refund
    /// cascade the confirmation sweeper applies runs instead, and the
    /// canceled record is returned as `ConfirmOutcome::DeadlineExpired`.
    pub async fn confirm(
        &self,
        appointment_id: Uuid,
        provider_id: Uuid,
    ) -> Result<ConfirmOutcome, AppointmentError> {
        let appointment = self.get(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(AppointmentError::Unauthorized);
        }

        let lifecycle = &self.lifecycle_service;
        let result = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                if apt.status == AppointmentStatus::Scheduled {
                    // Retried confirm; already applied.
                    return Ok(StepOutcome::Skip(apt));
                }
                lifecycle.validate_status_transition(&apt.status, &AppointmentStatus::Scheduled)?;
                if apt.status != AppointmentStatus::PendingProviderConfirmation {
                    // Pending-payment -> scheduled exists in the table, but
                    // only payment success may take it; a provider confirm on
                    // an unpaid booking is a caller error.
                    return Err(AppointmentError::InvalidTransition {
                        from: apt.status,
                        to: AppointmentStatus::Scheduled,
                    });
                }
                lifecycle.ensure_confirmable(&apt, now)?;

                apt.status = AppointmentStatus::Scheduled;
                apt.provider_confirmation_expires = None;
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await;

        match result {
            Ok(applied) => {
                if applied.changed {
                    info!("Appointment {} confirmed by provider {}", appointment_id, provider_id);
                    self.dispatcher.dispatch_notification(
                        NotificationKind::Confirmed,
                        appointment_id,
                        vec![applied.appointment.client_id],
                    );
                }
                Ok(ConfirmOutcome::Confirmed(applied.appointment))
            }
            Err(AppointmentError::DeadlineExpired) => {
                warn!(
                    "Confirmation for appointment {} arrived past the deadline",
                    appointment_id
                );
                match self.expire_confirmation(appointment_id).await? {
                    Some(canceled) => Ok(ConfirmOutcome::DeadlineExpired(canceled)),
                    None => {
                        // A sweeper pass (or another caller) resolved the
                        // record first; report whatever it settled on.
                        let current = self.get(appointment_id).await?;
                        match current.status {
                            AppointmentStatus::Scheduled => Ok(ConfirmOutcome::Confirmed(current)),
                            _ => Ok(ConfirmOutcome::DeadlineExpired(current)),
                        }
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel a non-terminal appointment. Only the assigned client, the
    /// assigned provider, or the system actor may cancel.
    pub async fn cancel(
        &self,
        appointment_id: Uuid,
        actor: CancelActor,
        reason: &str,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get(appointment_id).await?;
        match actor {
            CancelActor::Client(id) if id != appointment.client_id => {
                return Err(AppointmentError::Unauthorized)
            }
            CancelActor::Provider(id) if id != appointment.provider_id => {
                return Err(AppointmentError::Unauthorized)
            }
            _ => {}
        }

        let lifecycle = &self.lifecycle_service;
        let reason = reason.to_string();
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                if apt.status == AppointmentStatus::Canceled {
                    return Ok(StepOutcome::Skip(apt));
                }
                lifecycle.validate_status_transition(&apt.status, &AppointmentStatus::Canceled)?;

                apt.status = AppointmentStatus::Canceled;
                apt.cancellation_reason = Some(reason.clone());
                apt.provider_confirmation_expires = None;
                refund_in_record(&mut apt);
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if applied.changed {
            info!("Appointment {} canceled: {}", appointment_id, applied.appointment.cancellation_reason.as_deref().unwrap_or(""));
            self.settle_cancellation(&applied.appointment);
        }
        Ok(applied.appointment)
    }

    /// Provider marks a scheduled session as held, optionally attaching a
    /// summary and recommendations.
    pub async fn complete(
        &self,
        appointment_id: Uuid,
        provider_id: Uuid,
        summary: Option<String>,
        recommendations: Vec<Recommendation>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(AppointmentError::Unauthorized);
        }

        let lifecycle = &self.lifecycle_service;
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                if apt.status == AppointmentStatus::Completed {
                    return Ok(StepOutcome::Skip(apt));
                }
                lifecycle.validate_status_transition(&apt.status, &AppointmentStatus::Completed)?;

                apt.status = AppointmentStatus::Completed;
                if let Some(summary) = &summary {
                    apt.session_summary = Some(summary.clone());
                }
                apt.recommendations.extend(recommendations.iter().cloned());
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if applied.changed {
            info!("Appointment {} completed by provider {}", appointment_id, provider_id);
            self.dispatcher.dispatch_notification(
                NotificationKind::Completed,
                appointment_id,
                vec![applied.appointment.client_id, applied.appointment.provider_id],
            );
        }
        Ok(applied.appointment)
    }

    /// Provider records that the scheduled time passed with no session
    /// activity.
    pub async fn mark_no_show(
        &self,
        appointment_id: Uuid,
        provider_id: Uuid,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(AppointmentError::Unauthorized);
        }

        let lifecycle = &self.lifecycle_service;
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                if apt.status == AppointmentStatus::NoShow {
                    return Ok(StepOutcome::Skip(apt));
                }
                lifecycle.validate_status_transition(&apt.status, &AppointmentStatus::NoShow)?;

                apt.status = AppointmentStatus::NoShow;
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if applied.changed {
            info!("Appointment {} marked as no-show", appointment_id);
        }
        Ok(applied.appointment)
    }

    /// Payment success on a pending-payment booking. The record never held
    /// its slot, so the interval is re-validated, under the provider token,
    /// before the appointment goes straight to scheduled.
    pub async fn mark_paid(
        &self,
        appointment_id: Uuid,
        transaction_id: &str,
    ) -> Result<Appointment, AppointmentError> {
        for _attempt in 1..=self.rules.max_booking_attempts {
            let current = self.get(appointment_id).await?;
            match current.status {
                AppointmentStatus::Scheduled => return Ok(current),
                AppointmentStatus::PendingPayment => {}
                other => {
                    return Err(AppointmentError::InvalidTransition {
                        from: other,
                        to: AppointmentStatus::Scheduled,
                    })
                }
            }

            let token = self.store.provider_token(current.provider_id).await?;
            if self
                .conflict_service
                .has_conflict(
                    current.provider_id,
                    current.start_time,
                    current.end_time(),
                    Some(current.id),
                )
                .await?
            {
                warn!(
                    "Slot for appointment {} was taken while payment was pending",
                    appointment_id
                );
                return Err(AppointmentError::SlotUnavailable);
            }

            let mut next = current;
            next.status = AppointmentStatus::Scheduled;
            match &mut next.payment {
                Some(payment) => {
                    payment.status = PaymentStatus::Completed;
                    payment.transaction_id = Some(transaction_id.to_string());
                }
                None => {
                    return Err(AppointmentError::Validation(
                        "Appointment has no payment record".to_string(),
                    ))
                }
            }
            next.updated_at = self.clock.now();

            match self.store.update_with_token(next, token).await {
                Ok(stored) => {
                    info!("Appointment {} scheduled after payment success", appointment_id);
                    self.dispatcher.dispatch_notification(
                        NotificationKind::Confirmed,
                        appointment_id,
                        vec![stored.client_id, stored.provider_id],
                    );
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict) | Err(StoreError::TokenConflict) => {
                    debug!("Payment transition raced on appointment {}, retrying", appointment_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppointmentError::SlotUnavailable)
    }

    /// Provider schedules a follow-up after a completed session: the source
    /// record is annotated and a linked pending-payment appointment is
    /// created. The new record claims no slot until its payment lands.
    pub async fn schedule_follow_up(
        &self,
        appointment_id: Uuid,
        provider_id: Uuid,
        date: DateTime<Utc>,
        duration_minutes: i32,
        notes: Option<String>,
        fee_amount: f64,
    ) -> Result<Appointment, AppointmentError> {
        let source = self.get(appointment_id).await?;
        if source.provider_id != provider_id {
            return Err(AppointmentError::Unauthorized);
        }
        if source.status != AppointmentStatus::Completed {
            return Err(AppointmentError::Validation(
                "Follow-ups can only be scheduled from a completed session".to_string(),
            ));
        }

        let now = self.clock.now();
        self.lifecycle_service
            .validate_booking_request(date, duration_minutes, now, &self.rules)?;

        let follow_up = Appointment {
            id: Uuid::new_v4(),
            client_id: source.client_id,
            provider_id,
            start_time: date,
            duration_minutes,
            status: AppointmentStatus::PendingPayment,
            session_type: source.session_type,
            purpose: format!(
                "Follow-up to session on {}",
                source.start_time.format("%Y-%m-%d")
            ),
            notes: notes.clone(),
            provider_confirmation_expires: None,
            cancellation_reason: None,
            payment: Some(PaymentInfo {
                amount: fee_amount,
                status: PaymentStatus::Pending,
                transaction_id: None,
            }),
            session_summary: None,
            recommendations: Vec::new(),
            follow_up: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let stored = self.insert_new(follow_up, false).await?;
        let follow_up_id = stored.id;

        self.apply_with_retry(appointment_id, |mut apt, now| {
            apt.follow_up = Some(FollowUp {
                recommended: true,
                date,
                notes: notes.clone(),
                recommended_appointment_id: Some(follow_up_id),
            });
            apt.updated_at = now;
            Ok(StepOutcome::Write(apt))
        })
        .await?;

        info!(
            "Follow-up {} scheduled from appointment {}",
            follow_up_id, appointment_id
        );
        self.dispatcher.dispatch_notification(
            NotificationKind::FollowUp,
            follow_up_id,
            vec![stored.client_id],
        );
        Ok(stored)
    }

    /// Late annotation of a completed session (summary and appended
    /// recommendations). Terminal records accept nothing else.
    pub async fn record_session_results(
        &self,
        appointment_id: Uuid,
        provider_id: Uuid,
        summary: Option<String>,
        recommendations: Vec<Recommendation>,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get(appointment_id).await?;
        if appointment.provider_id != provider_id {
            return Err(AppointmentError::Unauthorized);
        }

        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                if apt.status != AppointmentStatus::Completed {
                    return Err(AppointmentError::Validation(
                        "Session results can only be recorded on completed appointments"
                            .to_string(),
                    ));
                }
                if let Some(summary) = &summary {
                    apt.session_summary = Some(summary.clone());
                }
                apt.recommendations.extend(recommendations.iter().cloned());
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        Ok(applied.appointment)
    }

    // ==========================================================================
    // TIME-TRIGGERED TRANSITIONS (shared with the sweepers)
    // ==========================================================================

    /// Cancel a pending-provider-confirmation appointment whose deadline has
    /// lapsed, refunding the captured payment and notifying both parties.
    /// Returns `None` when a racing transition already resolved the record.
    pub async fn expire_confirmation(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                let overdue = apt.status == AppointmentStatus::PendingProviderConfirmation
                    && apt.provider_confirmation_expires.map_or(false, |d| d <= now);
                if !overdue {
                    return Ok(StepOutcome::Skip(apt));
                }

                apt.status = AppointmentStatus::Canceled;
                apt.cancellation_reason = Some("Provider did not confirm in time".to_string());
                apt.provider_confirmation_expires = None;
                refund_in_record(&mut apt);
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if !applied.changed {
            return Ok(None);
        }

        warn!(
            "Appointment {} canceled: provider did not confirm in time",
            appointment_id
        );
        self.settle_cancellation(&applied.appointment);
        Ok(Some(applied.appointment))
    }

    /// Cancel a pending-payment appointment whose payment window has
    /// elapsed. Refunds only a payment already in a refundable state.
    pub async fn expire_payment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let window = Duration::hours(self.rules.payment_window_hours);
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                let overdue = apt.status == AppointmentStatus::PendingPayment
                    && now - apt.created_at >= window;
                if !overdue {
                    return Ok(StepOutcome::Skip(apt));
                }

                apt.status = AppointmentStatus::Canceled;
                apt.cancellation_reason = Some("Payment time limit exceeded".to_string());
                refund_in_record(&mut apt);
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if !applied.changed {
            return Ok(None);
        }

        info!(
            "Appointment {} canceled: payment window exceeded",
            appointment_id
        );
        self.settle_cancellation(&applied.appointment);
        Ok(Some(applied.appointment))
    }

    /// Complete a scheduled appointment whose end time has passed, attaching
    /// a default summary when the provider never supplied one.
    pub async fn finish_elapsed_session(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let applied = self
            .apply_with_retry(appointment_id, |mut apt, now| {
                let elapsed =
                    apt.status == AppointmentStatus::Scheduled && apt.end_time() <= now;
                if !elapsed {
                    return Ok(StepOutcome::Skip(apt));
                }

                apt.status = AppointmentStatus::Completed;
                if apt.session_summary.is_none() {
                    apt.session_summary = Some(
                        "This session was automatically marked as completed when its scheduled time ended."
                            .to_string(),
                    );
                }
                apt.updated_at = now;
                Ok(StepOutcome::Write(apt))
            })
            .await?;

        if !applied.changed {
            return Ok(None);
        }

        info!("Appointment {} auto-completed at session end", appointment_id);
        self.dispatcher.dispatch_notification(
            NotificationKind::Completed,
            appointment_id,
            vec![applied.appointment.client_id, applied.appointment.provider_id],
        );
        Ok(Some(applied.appointment))
    }

    // ==========================================================================
    // INTERNALS
    // ==========================================================================

    /// Read-guard-apply-write loop over a single record.
    ///
    /// A version conflict means another writer advanced the record; the
    /// closure re-runs against the fresh copy, where its guard re-checks the
    /// current status. That re-check is what makes a user action and a sweep
    /// racing on one appointment produce exactly one winning transition.
    async fn apply_with_retry<F>(
        &self,
        appointment_id: Uuid,
        step: F,
    ) -> Result<Applied, AppointmentError>
    where
        F: Fn(Appointment, DateTime<Utc>) -> Result<StepOutcome, AppointmentError>,
    {
        loop {
            let current = self.get(appointment_id).await?;
            let now = self.clock.now();

            match step(current, now)? {
                StepOutcome::Skip(appointment) => {
                    return Ok(Applied {
                        appointment,
                        changed: false,
                    })
                }
                StepOutcome::Write(next) => match self.store.update(next).await {
                    Ok(stored) => {
                        return Ok(Applied {
                            appointment: stored,
                            changed: true,
                        })
                    }
                    Err(StoreError::VersionConflict) => {
                        debug!("Record version moved for appointment {}, retrying", appointment_id);
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Post-commit side effects of a cancellation. The state has already
    /// flipped; ledger and notifier calls are dispatched asynchronously and
    /// never undo it.
    fn settle_cancellation(&self, appointment: &Appointment) {
        if let Some(payment) = &appointment.payment {
            if payment.status == PaymentStatus::Refunded {
                match &payment.transaction_id {
                    Some(reference) => {
                        self.dispatcher.dispatch_refund(appointment.id, reference.clone());
                        self.dispatcher.dispatch_notification(
                            NotificationKind::PaymentRefunded,
                            appointment.id,
                            vec![appointment.client_id],
                        );
                    }
                    None => warn!(
                        "Payment for appointment {} marked refunded without a ledger reference",
                        appointment.id
                    ),
                }
            }
        }

        self.dispatcher.dispatch_notification(
            NotificationKind::Canceled,
            appointment.id,
            vec![appointment.client_id, appointment.provider_id],
        );
    }

    /// Undo a captured payment for a booking that never committed.
    fn release_payment(&self, appointment: &Appointment) {
        if let Some(payment) = &appointment.payment {
            if payment.is_refundable() {
                if let Some(reference) = &payment.transaction_id {
                    self.dispatcher.dispatch_refund(appointment.id, reference.clone());
                }
            }
        }
    }
}

/// Flip a refundable payment to refunded inside the record. The matching
/// ledger call is dispatched after the write commits.
fn refund_in_record(appointment: &mut Appointment) {
    if let Some(payment) = &mut appointment.payment {
        if payment.is_refundable() {
            payment.status = PaymentStatus::Refunded;
        }
    }
}
