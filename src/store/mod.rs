pub mod memory;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::coordinate::{Coordinate, OperatorId};
use crate::models::duty::Duty;

pub use memory::InMemoryDutyStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duty already exists for {operator_id} on {date}")]
    DutyExists {
        operator_id: OperatorId,
        date: NaiveDate,
    },

    #[error("duty {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Unavailable(String),
}

/// System of record for duties. Implementations must reject a second
/// `create_duty` for the same (operator, date).
pub trait DutyStore: Send + Sync {
    fn get_duty(&self, operator_id: &OperatorId, date: NaiveDate)
        -> Result<Option<Duty>, StoreError>;

    fn create_duty(
        &self,
        operator_id: &OperatorId,
        date: NaiveDate,
        start_time: DateTime<Utc>,
        start_position: Coordinate,
    ) -> Result<Duty, StoreError>;

    fn update_duty_end(
        &self,
        duty_id: Uuid,
        end_time: DateTime<Utc>,
        end_position: Coordinate,
        distance_km: f64,
    ) -> Result<Duty, StoreError>;

    /// Duties on `date` that have started but not ended.
    fn active_duties(&self, date: NaiveDate) -> Result<Vec<Duty>, StoreError>;
}
