use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::coordinate::{Coordinate, OperatorId};
use crate::models::duty::Duty;
use crate::store::{DutyStore, StoreError};

type DutyKey = (OperatorId, NaiveDate);

#[derive(Default)]
pub struct InMemoryDutyStore {
    duties: DashMap<DutyKey, Duty>,
    by_id: DashMap<Uuid, DutyKey>,
}

impl InMemoryDutyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.duties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.duties.is_empty()
    }
}

impl DutyStore for InMemoryDutyStore {
    fn get_duty(
        &self,
        operator_id: &OperatorId,
        date: NaiveDate,
    ) -> Result<Option<Duty>, StoreError> {
        Ok(self
            .duties
            .get(&(operator_id.clone(), date))
            .map(|entry| entry.value().clone()))
    }

    fn create_duty(
        &self,
        operator_id: &OperatorId,
        date: NaiveDate,
        start_time: DateTime<Utc>,
        start_position: Coordinate,
    ) -> Result<Duty, StoreError> {
        match self.duties.entry((operator_id.clone(), date)) {
            Entry::Occupied(_) => Err(StoreError::DutyExists {
                operator_id: operator_id.clone(),
                date,
            }),
            Entry::Vacant(slot) => {
                let duty = Duty {
                    id: Uuid::new_v4(),
                    operator_id: operator_id.clone(),
                    date,
                    start_time: Some(start_time),
                    start_position: Some(start_position),
                    end_time: None,
                    end_position: None,
                    total_collection: 0.0,
                    distance_km: 0.0,
                };
                self.by_id.insert(duty.id, (operator_id.clone(), date));
                slot.insert(duty.clone());
                Ok(duty)
            }
        }
    }

    fn update_duty_end(
        &self,
        duty_id: Uuid,
        end_time: DateTime<Utc>,
        end_position: Coordinate,
        distance_km: f64,
    ) -> Result<Duty, StoreError> {
        let key = self
            .by_id
            .get(&duty_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(duty_id))?;

        let mut duty = self
            .duties
            .get_mut(&key)
            .ok_or(StoreError::NotFound(duty_id))?;

        duty.end_time = Some(end_time);
        duty.end_position = Some(end_position);
        duty.distance_km = distance_km;

        Ok(duty.clone())
    }

    fn active_duties(&self, date: NaiveDate) -> Result<Vec<Duty>, StoreError> {
        Ok(self
            .duties
            .iter()
            .filter(|entry| entry.key().1 == date && entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str) -> OperatorId {
        OperatorId::new(id).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn origin() -> Coordinate {
        Coordinate::new(19.07, 72.87).unwrap()
    }

    #[test]
    fn second_create_for_same_day_is_rejected() {
        let store = InMemoryDutyStore::new();
        store
            .create_duty(&op("a"), day(), Utc::now(), origin())
            .unwrap();

        let err = store
            .create_duty(&op("a"), day(), Utc::now(), origin())
            .unwrap_err();
        assert!(matches!(err, StoreError::DutyExists { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn next_day_gets_its_own_row() {
        let store = InMemoryDutyStore::new();
        let tomorrow = day().succ_opt().unwrap();
        store
            .create_duty(&op("a"), day(), Utc::now(), origin())
            .unwrap();
        store
            .create_duty(&op("a"), tomorrow, Utc::now(), origin())
            .unwrap();

        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_end_marks_duty_completed() {
        let store = InMemoryDutyStore::new();
        let duty = store
            .create_duty(&op("a"), day(), Utc::now(), origin())
            .unwrap();
        assert_eq!(store.active_duties(day()).unwrap().len(), 1);

        let end = Coordinate::new(19.10, 72.87).unwrap();
        let ended = store
            .update_duty_end(duty.id, Utc::now(), end, 3.3)
            .unwrap();

        assert_eq!(ended.end_position, Some(end));
        assert_eq!(ended.distance_km, 3.3);
        assert!(store.active_duties(day()).unwrap().is_empty());
        assert!(!store.get_duty(&op("a"), day()).unwrap().unwrap().is_active());
    }

    #[test]
    fn update_unknown_duty_is_not_found() {
        let store = InMemoryDutyStore::new();
        let err = store
            .update_duty_end(Uuid::new_v4(), Utc::now(), origin(), 0.0)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
