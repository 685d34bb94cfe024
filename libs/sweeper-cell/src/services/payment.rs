use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error};

use appointment_cell::store::AppointmentStore;
use appointment_cell::SchedulingService;
use shared_utils::Clock;

use crate::models::{SweepReport, SweeperError};

/// Cancels pending-payment appointments whose payment window has elapsed.
pub struct PaymentSweeper {
    scheduling: Arc<SchedulingService>,
    store: Arc<dyn AppointmentStore>,
    clock: Arc<dyn Clock>,
    window_hours: i64,
}

impl PaymentSweeper {
    pub fn new(
        scheduling: Arc<SchedulingService>,
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
        window_hours: i64,
    ) -> Self {
        Self {
            scheduling,
            store,
            clock,
            window_hours,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, SweeperError> {
        let cutoff = self.clock.now() - Duration::hours(self.window_hours);
        let unpaid = self
            .store
            .payment_window_elapsed(cutoff)
            .await
            .map_err(appointment_cell::models::AppointmentError::from)?;

        debug!("Payment sweep found {} expired unpaid appointments", unpaid.len());

        let mut report = SweepReport {
            scanned: unpaid.len(),
            ..SweepReport::default()
        };

        for appointment in unpaid {
            match self.scheduling.expire_payment(appointment.id).await {
                Ok(Some(_)) => report.transitioned += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!("Payment sweep failed on appointment {}: {}", appointment.id, e);
                }
            }
        }

        Ok(report)
    }
}
