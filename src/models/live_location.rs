use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::coordinate::{Coordinate, OperatorId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLocationEntry {
    pub operator_id: OperatorId,
    pub coordinate: Coordinate,
    pub last_updated: DateTime<Utc>,
}
