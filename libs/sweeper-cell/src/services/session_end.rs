use std::sync::Arc;

use tracing::{debug, error};

use appointment_cell::store::AppointmentStore;
use appointment_cell::SchedulingService;
use shared_utils::Clock;

use crate::models::{SweepReport, SweeperError};

/// Completes scheduled appointments whose end time has passed, attaching a
/// default summary when the provider never supplied one.
pub struct SessionEndSweeper {
    scheduling: Arc<SchedulingService>,
    store: Arc<dyn AppointmentStore>,
    clock: Arc<dyn Clock>,
}

impl SessionEndSweeper {
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
        let elapsed = self
            .store
            .session_ended(now)
            .await
            .map_err(appointment_cell::models::AppointmentError::from)?;

        debug!("Session-end sweep found {} sessions to close", elapsed.len());

        let mut report = SweepReport {
            scanned: elapsed.len(),
            ..SweepReport::default()
        };

        for appointment in elapsed {
            match self.scheduling.finish_elapsed_session(appointment.id).await {
                Ok(Some(_)) => report.transitioned += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(
                        "Session-end sweep failed on appointment {}: {}",
                        appointment.id, e
                    );
                }
            }
        }

        Ok(report)
    }
}
