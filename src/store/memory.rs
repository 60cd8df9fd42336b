use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;

use super::{same_booked_slot, AppointmentStore, StoreError};

/// Volatile store used when no data directory is configured.
/// Records live in insertion order behind one mutex.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<Appointment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryStore {
    async fn day(&self, location_id: &str, date: CivilDate) -> Result<Vec<Appointment>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|a| a.location_id == location_id && a.date == date)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.records.lock().await.iter().find(|a| a.id == id).cloned())
    }

    async fn insert(&self, appointment: Appointment) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|a| same_booked_slot(a, &appointment)) {
            return Err(StoreError::Duplicate(appointment.slot_key()));
        }
        records.push(appointment);
        Ok(())
    }

    async fn replace(&self, appointment: Appointment) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let idx = records
            .iter()
            .position(|a| a.id == appointment.id)
            .ok_or(StoreError::NotFound(appointment.id))?;
        if records
            .iter()
            .any(|a| a.id != appointment.id && same_booked_slot(a, &appointment))
        {
            return Err(StoreError::Duplicate(appointment.slot_key()));
        }
        records[idx] = appointment;
        Ok(())
    }

    async fn remove(&self, id: Ulid) -> Result<Appointment, StoreError> {
        let mut records = self.records.lock().await;
        let idx = records
            .iter()
            .position(|a| a.id == id)
            .ok_or(StoreError::NotFound(id))?;
        Ok(records.remove(idx))
    }

    async fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|a| filter.matches(a)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    #[tokio::test]
    async fn insert_rejects_second_booking_on_same_slot() {
        let store = InMemoryStore::new();
        store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        let err = store
            .insert(appointment("A", "S1", "2025-01-10", "10:00", &["beard"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // other staff, other location, other time are all fine
        store.insert(appointment("A", "S2", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        store.insert(appointment("B", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        store.insert(appointment("A", "S1", "2025-01-10", "10:30", &["cut"])).await.unwrap();
        assert_eq!(store.day("A", date("2025-01-10")).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancelled_records_do_not_hold_the_slot() {
        let store = InMemoryStore::new();
        let mut first = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        first.status = AppointmentStatus::Cancelled;
        store.insert(first.clone()).await.unwrap();
        store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();

        // reviving the cancelled record now collides
        first.status = AppointmentStatus::Booked;
        assert!(matches!(store.replace(first).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn replace_and_remove() {
        let store = InMemoryStore::new();
        let mut appt = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        store.insert(appt.clone()).await.unwrap();

        appt.time = time("11:00");
        store.replace(appt.clone()).await.unwrap();
        assert_eq!(store.get(appt.id).await.unwrap().unwrap().time, time("11:00"));

        let removed = store.remove(appt.id).await.unwrap();
        assert_eq!(removed.id, appt.id);
        assert!(store.get(appt.id).await.unwrap().is_none());
        assert!(matches!(store.remove(appt.id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.replace(appt).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_applies_filter() {
        let store = InMemoryStore::new();
        store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        store.insert(appointment("A", "S2", "2025-01-11", "10:00", &["cut"])).await.unwrap();
        let filter = AppointmentFilter {
            date: Some(date("2025-01-11")),
            ..Default::default()
        };
        let found = store.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].staff_id, "S2");
    }
}
