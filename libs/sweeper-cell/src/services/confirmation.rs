use std::sync::Arc;

use tracing::{debug, error};

use appointment_cell::store::AppointmentStore;
use appointment_cell::SchedulingService;
use shared_utils::Clock;

use crate::models::{SweepReport, SweeperError};

/// Cancels pending-provider-confirmation appointments whose deadline has
/// lapsed, through the same expiry transition a late `confirm` takes.
///
/// Stateless: each pass re-scans by deadline predicate, so a missed or
/// duplicated cycle is safe.
pub struct ConfirmationSweeper {
    scheduling: Arc<SchedulingService>,
    store: Arc<dyn AppointmentStore>,
    clock: Arc<dyn Clock>,
}

impl ConfirmationSweeper {
    pub fn new(
        scheduling: Arc<SchedulingService>,
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduling,
            store,
            clock,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, SweeperError> {
        let now = self.clock.now();
        let overdue = self
            .store
            .confirmation_expired(now)
            .await
            .map_err(appointment_cell::models::AppointmentError::from)?;

        debug!(
            "Confirmation sweep found {} appointments past their deadline",
            overdue.len()
        );

        let mut report = SweepReport {
            scanned: overdue.len(),
            ..SweepReport::default()
        };

        for appointment in overdue {
            match self.scheduling.expire_confirmation(appointment.id).await {
                Ok(Some(_)) => report.transitioned += 1,
                // A user action resolved the record between scan and apply.
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "Confirmation sweep failed on appointment {}: {}",
                        appointment.id, e
                    );
                }
            }
        }

        Ok(report)
    }
}
