use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use appointment_cell::store::AppointmentStore;
use appointment_cell::SchedulingService;
use shared_config::AppConfig;
use shared_utils::Clock;

use crate::models::SweepReport;
use crate::services::confirmation::ConfirmationSweeper;
use crate::services::payment::PaymentSweeper;
use crate::services::session_end::SessionEndSweeper;

/// Owns the three periodic sweeps and their timers.
///
/// The sweepers themselves are pure `run_once` scans; the supervisor only
/// supplies the cadence. Tests drive `run_once` directly with a manual clock
/// and never touch real timers.
pub struct SweeperSupervisor {
    confirmation: Arc<ConfirmationSweeper>,
    payment: Arc<PaymentSweeper>,
    session_end: Arc<SessionEndSweeper>,
    confirmation_interval: Duration,
    payment_interval: Duration,
    session_end_interval: Duration,
    is_shutdown: Arc<tokio::sync::RwLock<bool>>,
}

impl SweeperSupervisor {
    pub fn new(
        scheduling: Arc<SchedulingService>,
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            confirmation: Arc::new(ConfirmationSweeper::new(
                Arc::clone(&scheduling),
                Arc::clone(&store),
                Arc::clone(&clock),
            )),
            payment: Arc::new(PaymentSweeper::new(
                Arc::clone(&scheduling),
                Arc::clone(&store),
                Arc::clone(&clock),
                config.payment_window_hours,
            )),
            session_end: Arc::new(SessionEndSweeper::new(scheduling, store, clock)),
            confirmation_interval: Duration::from_secs(config.confirmation_sweep_interval_secs),
            payment_interval: Duration::from_secs(config.payment_sweep_interval_secs),
            session_end_interval: Duration::from_secs(config.session_end_sweep_interval_secs),
            is_shutdown: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    /// Spawn the three sweep loops. Each ticks on its own timer and logs its
    /// report; a failed pass is logged and retried on the next tick.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!("Starting expiry sweepers");

        vec![
            self.spawn_loop("confirmation", self.confirmation_interval, {
                let sweeper = Arc::clone(&self.confirmation);
                move || {
                    let sweeper = Arc::clone(&sweeper);
                    async move { sweeper.run_once().await.map_err(|e| e.to_string()) }
                }
            }),
            self.spawn_loop("payment", self.payment_interval, {
                let sweeper = Arc::clone(&self.payment);
                move || {
                    let sweeper = Arc::clone(&sweeper);
                    async move { sweeper.run_once().await.map_err(|e| e.to_string()) }
                }
            }),
            self.spawn_loop("session-end", self.session_end_interval, {
                let sweeper = Arc::clone(&self.session_end);
                move || {
                    let sweeper = Arc::clone(&sweeper);
                    async move { sweeper.run_once().await.map_err(|e| e.to_string()) }
                }
            }),
        ]
    }

    /// Run the sweep loops in place until `shutdown` is requested from
    /// another task.
    pub async fn run(&self) {
        let handles = self.start();
        let _ = futures::future::join_all(handles).await;
    }

    pub async fn shutdown(&self) {
        info!("Stopping expiry sweepers");
        *self.is_shutdown.write().await = true;
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, run: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<SweepReport, String>> + Send,
    {
        let is_shutdown = Arc::clone(&self.is_shutdown);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // A stalled pass must not be compensated with a burst of extra runs;
            // the scans are deadline-predicated and catch up on their own.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if *is_shutdown.read().await {
                    info!("Sweep loop '{}' stopped", name);
                    break;
                }

                match run().await {
                    Ok(report) => {
                        if report.scanned > 0 {
                            info!(
                                "Sweep '{}': scanned {}, transitioned {}, failed {}",
                                name, report.scanned, report.transitioned, report.failed
                            );
                        }
                    }
                    Err(e) => error!("Sweep '{}' pass failed: {}", name, e),
                }
            }
        })
    }

    pub fn confirmation_sweeper(&self) -> Arc<ConfirmationSweeper> {
        Arc::clone(&self.confirmation)
    }

    pub fn payment_sweeper(&self) -> Arc<PaymentSweeper> {
        Arc::clone(&self.payment)
    }

    pub fn session_end_sweeper(&self) -> Arc<SessionEndSweeper> {
        Arc::clone(&self.session_end)
    }
}
