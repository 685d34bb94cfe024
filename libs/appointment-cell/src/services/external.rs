// libs/appointment-cell/src/services/external.rs
//
// Ports to the external ledger and notifier. The engine only emits requests:
// payment capture is the one synchronous call (a booking cannot proceed
// without it), while refunds and notifications are dispatched in the
// background with bounded retry and never gate a state transition.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::AppointmentError;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ExternalCallError(pub String);

/// External payment ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Capture a payment; returns the ledger's transaction reference.
    async fn charge(&self, amount: f64, payer: Uuid) -> Result<String, ExternalCallError>;

    async fn refund(&self, reference: &str) -> Result<(), ExternalCallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Booked,
    Confirmed,
    Canceled,
    Completed,
    Reminder,
    PaymentRefunded,
    FollowUp,
}

/// External notification delivery (email/chat/push lives elsewhere).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        kind: NotificationKind,
        appointment_id: Uuid,
        recipients: Vec<Uuid>,
    ) -> Result<(), ExternalCallError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Fans side effects out to the ledger and notifier.
pub struct SideEffectDispatcher {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl SideEffectDispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            notifier,
            policy,
        }
    }

    /// Synchronous payment capture. This is the only external call that can
    /// fail an operation.
    pub async fn charge(&self, amount: f64, payer: Uuid) -> Result<String, AppointmentError> {
        self.ledger
            .charge(amount, payer)
            .await
            .map_err(|e| AppointmentError::ExternalService(format!("payment capture failed: {}", e)))
    }

    /// Request a refund in the background. A ledger outage degrades to
    /// logged retries; the cancellation it belongs to has already committed.
    pub fn dispatch_refund(&self, appointment_id: Uuid, reference: String) {
        let ledger = Arc::clone(&self.ledger);
        let policy = self.policy.clone();

        tokio::spawn(async move {
            for attempt in 1..=policy.attempts {
                match ledger.refund(&reference).await {
                    Ok(()) => {
                        info!("Refund issued for appointment {}", appointment_id);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "Refund attempt {}/{} failed for appointment {}: {}",
                            attempt, policy.attempts, appointment_id, e
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(
                            policy.backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
            error!(
                "Giving up on refund for appointment {} after {} attempts",
                appointment_id, policy.attempts
            );
        });
    }

    /// Fire-and-forget notification request with bounded retry.
    pub fn dispatch_notification(
        &self,
        kind: NotificationKind,
        appointment_id: Uuid,
        recipients: Vec<Uuid>,
    ) {
        let notifier = Arc::clone(&self.notifier);
        let policy = self.policy.clone();

        tokio::spawn(async move {
            for attempt in 1..=policy.attempts {
                match notifier.notify(kind, appointment_id, recipients.clone()).await {
                    Ok(()) => {
                        debug!("Notification {:?} sent for appointment {}", kind, appointment_id);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "Notification attempt {}/{} failed for appointment {}: {}",
                            attempt, policy.attempts, appointment_id, e
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(
                            policy.backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
            error!(
                "Giving up on {:?} notification for appointment {} after {} attempts",
                kind, appointment_id, policy.attempts
            );
        });
    }
}

// ==============================================================================
// RECORDING FAKES
// ==============================================================================

/// Ledger that records calls and always succeeds. Backs tests and embedding
/// callers that have no real payment provider wired up.
#[derive(Default)]
pub struct RecordingLedger {
    pub charges: Mutex<Vec<(f64, Uuid)>>,
    pub refunds: Mutex<Vec<String>>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn charge(&self, amount: f64, payer: Uuid) -> Result<String, ExternalCallError> {
        self.charges.lock().await.push((amount, payer));
        Ok(format!("txn-{}", Uuid::new_v4()))
    }

    async fn refund(&self, reference: &str) -> Result<(), ExternalCallError> {
        self.refunds.lock().await.push(reference.to_string());
        Ok(())
    }
}

/// Notifier that records requests instead of delivering them.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotificationKind, Uuid, Vec<Uuid>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn kinds_for(&self, appointment_id: Uuid) -> Vec<NotificationKind> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, id, _)| *id == appointment_id)
            .map(|(kind, _, _)| *kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        appointment_id: Uuid,
        recipients: Vec<Uuid>,
    ) -> Result<(), ExternalCallError> {
        self.sent.lock().await.push((kind, appointment_id, recipients));
        Ok(())
    }
}
