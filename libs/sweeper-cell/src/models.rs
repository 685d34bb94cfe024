use serde::{Deserialize, Serialize};

use appointment_cell::models::AppointmentError;

/// Outcome of one sweep pass. Per-record failures are counted, not
/// propagated: one malformed record never halts the rest of the scan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub transitioned: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SweeperError {
    /// The scan itself failed; individual transition errors never surface
    /// here.
    #[error("Sweep scan failed: {0}")]
    Scan(#[from] AppointmentError),
}
