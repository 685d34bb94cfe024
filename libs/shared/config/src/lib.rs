use std::env;
use tracing::warn;

/// Which initial state a freshly booked appointment lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingPolicy {
    /// Payment is captured at booking time; the appointment waits for the
    /// provider to confirm.
    ConfirmationFirst,
    /// The appointment waits for payment; confirmation is skipped once the
    /// payment succeeds.
    PaymentFirst,
}

impl BookingPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmation-first" => Some(BookingPolicy::ConfirmationFirst),
            "payment-first" => Some(BookingPolicy::PaymentFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub booking_policy: BookingPolicy,
    pub slot_stride_minutes: i64,
    pub payment_window_hours: i64,
    pub confirmation_window_minutes: i64,
    pub confirmation_collapse_hours: i64,
    pub confirmation_sweep_interval_secs: u64,
    pub payment_sweep_interval_secs: u64,
    pub session_end_sweep_interval_secs: u64,
    pub max_booking_attempts: u32,
    pub side_effect_retry_attempts: u32,
    pub side_effect_retry_backoff_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            booking_policy: env::var("BOOKING_POLICY")
                .ok()
                .and_then(|v| {
                    let parsed = BookingPolicy::parse(&v);
                    if parsed.is_none() {
                        warn!("BOOKING_POLICY '{}' not recognized, using confirmation-first", v);
                    }
                    parsed
                })
                .unwrap_or(BookingPolicy::ConfirmationFirst),
            slot_stride_minutes: read_i64("SLOT_STRIDE_MINUTES", 30),
            payment_window_hours: read_i64("PAYMENT_WINDOW_HOURS", 24),
            confirmation_window_minutes: read_i64("CONFIRMATION_WINDOW_MINUTES", 60),
            confirmation_collapse_hours: read_i64("CONFIRMATION_COLLAPSE_HOURS", 24),
            confirmation_sweep_interval_secs: read_u64("CONFIRMATION_SWEEP_INTERVAL_SECS", 300),
            payment_sweep_interval_secs: read_u64("PAYMENT_SWEEP_INTERVAL_SECS", 3600),
            session_end_sweep_interval_secs: read_u64("SESSION_END_SWEEP_INTERVAL_SECS", 300),
            max_booking_attempts: read_u64("MAX_BOOKING_ATTEMPTS", 3) as u32,
            side_effect_retry_attempts: read_u64("SIDE_EFFECT_RETRY_ATTEMPTS", 3) as u32,
            side_effect_retry_backoff_ms: read_u64("SIDE_EFFECT_RETRY_BACKOFF_MS", 500),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            booking_policy: BookingPolicy::ConfirmationFirst,
            slot_stride_minutes: 30,
            payment_window_hours: 24,
            confirmation_window_minutes: 60,
            confirmation_collapse_hours: 24,
            confirmation_sweep_interval_secs: 300,
            payment_sweep_interval_secs: 3600,
            session_end_sweep_interval_secs: 300,
            max_booking_attempts: 3,
            side_effect_retry_attempts: 3,
            side_effect_retry_backoff_ms: 500,
        }
    }
}

fn read_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("{} '{}' is not a number, using {}", key, value, default);
            default
        }),
        Err(_) => default,
    }
}

fn read_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("{} '{}' is not a number, using {}", key, value, default);
            default
        }),
        Err(_) => default,
    }
}
