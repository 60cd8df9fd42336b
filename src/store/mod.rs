//! Appointment persistence.
//!
//! The engine talks to one `AppointmentStore` chosen at startup. Every store
//! enforces the same final guard: at most one Booked record per
//! (location, staff, date, start).

mod memory;
mod wal_store;

pub use memory::InMemoryStore;
pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("slot already booked: {0}")]
    Duplicate(SlotKey),
    #[error("appointment not found: {0}")]
    NotFound(Ulid),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Every record (any status) at `location_id` on `date`.
    async fn day(&self, location_id: &str, date: CivilDate) -> Result<Vec<Appointment>, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    async fn insert(&self, appointment: Appointment) -> Result<(), StoreError>;

    /// Overwrite the record with the same id.
    async fn replace(&self, appointment: Appointment) -> Result<(), StoreError>;

    async fn remove(&self, id: Ulid) -> Result<Appointment, StoreError>;

    /// Matching records in no particular order.
    async fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError>;
}

/// True when both records are Booked on the same slot key.
pub(crate) fn same_booked_slot(a: &Appointment, b: &Appointment) -> bool {
    a.status.blocks()
        && b.status.blocks()
        && a.time == b.time
        && a.date == b.date
        && a.staff_id == b.staff_id
        && a.location_id == b.location_id
}
