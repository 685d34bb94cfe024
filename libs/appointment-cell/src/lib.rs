pub mod models;
pub mod services;
pub mod store;

// Re-export all models and services for external use
pub use models::*;
pub use services::*;
pub use store::{AppointmentStore, InMemoryAppointmentStore, StoreError};
