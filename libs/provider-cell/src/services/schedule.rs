use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{AvailabilityError, WeeklySchedule};

/// Source of provider weekly schedules. The profile service that maintains
/// them lives outside this engine; callers only need the read side.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn weekly_schedule(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<WeeklySchedule>, AvailabilityError>;
}

/// In-memory schedule store used by tests and embedding callers.
#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: RwLock<HashMap<Uuid, WeeklySchedule>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, provider_id: Uuid, schedule: WeeklySchedule) {
        self.schedules.write().await.insert(provider_id, schedule);
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn weekly_schedule(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<WeeklySchedule>, AvailabilityError> {
        Ok(self.schedules.read().await.get(&provider_id).cloned())
    }
}
