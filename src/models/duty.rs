use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::coordinate::{Coordinate, OperatorId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DutyState {
    Idle,
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Duty {
    pub id: Uuid,
    pub operator_id: OperatorId,
    pub date: NaiveDate,
    pub start_time: Option<DateTime<Utc>>,
    pub start_position: Option<Coordinate>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_position: Option<Coordinate>,
    pub total_collection: f64,
    pub distance_km: f64,
}

impl Duty {
    pub fn state(&self) -> DutyState {
        match (self.start_time, self.end_time) {
            (Some(_), None) => DutyState::Active,
            (_, Some(_)) => DutyState::Completed,
            (None, None) => DutyState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == DutyState::Active
    }
}
