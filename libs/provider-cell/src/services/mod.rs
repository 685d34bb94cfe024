pub mod availability;
pub mod schedule;

pub use availability::AvailabilityService;
pub use schedule::{InMemoryScheduleRepository, ScheduleRepository};
