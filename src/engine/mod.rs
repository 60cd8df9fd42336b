//! Scheduling engine: availability reads and conflict-guarded writes over
//! one `AppointmentStore`.

mod assign;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use assign::assign;
pub use availability::{candidates, granularity};
pub use conflict::overlaps;
pub use error::EngineError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::catalog::{Catalog, Location};
use crate::limits::*;
use crate::model::*;
use crate::store::AppointmentStore;

/// Locations a caller may act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Location(String),
}

impl Scope {
    pub fn permits(&self, location_id: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Location(own) => own == location_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer: Customer,
    pub location_id: String,
    pub staff: StaffChoice,
    pub date: CivilDate,
    pub time: ClockTime,
    pub service_ids: Vec<String>,
}

/// Staff edit. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location_id: Option<String>,
    pub staff: Option<StaffChoice>,
    pub date: Option<CivilDate>,
    pub time: Option<ClockTime>,
    pub service_ids: Option<Vec<String>>,
    pub status: Option<AppointmentStatus>,
}

impl AppointmentPatch {
    pub fn is_empty(&self) -> bool {
        *self == AppointmentPatch::default()
    }

    pub fn status_only(&self) -> Option<AppointmentStatus> {
        let rest = AppointmentPatch {
            status: None,
            ..self.clone()
        };
        if rest.is_empty() { self.status } else { None }
    }
}

type LaneMap = DashMap<LaneKey, Arc<Mutex<()>>>;

pub struct Engine {
    catalog: Arc<Catalog>,
    store: Arc<dyn AppointmentStore>,
    /// One async mutex per (location, date) with writes in flight.
    lanes: LaneMap,
}

/// Held lane locks. Idle lane entries are pruned on drop.
pub(super) struct LaneGuard<'a> {
    lanes: &'a LaneMap,
    held: Vec<(LaneKey, OwnedMutexGuard<()>)>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.lanes.remove_if(&key, |_, lane| Arc::strong_count(lane) == 1);
        }
    }
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn AppointmentStore>) -> Self {
        Self {
            catalog,
            store,
            lanes: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Lanes currently tracked (locked or awaited).
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Lock every lane in `keys`, in sorted order so overlapping callers cannot deadlock.
    pub(super) async fn lock_lanes(&self, mut keys: Vec<LaneKey>) -> LaneGuard<'_> {
        keys.sort();
        keys.dedup();
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let lane = self.lanes.entry(key.clone()).or_default().clone();
            held.push((key, lane.lock_owned().await));
        }
        LaneGuard {
            lanes: &self.lanes,
            held,
        }
    }

    pub(super) fn location(&self, id: &str) -> Result<&Location, EngineError> {
        self.catalog
            .location(id)
            .ok_or_else(|| EngineError::invalid(format!("unknown location: {id}")))
    }

    pub(super) fn check_staff(location: &Location, staff: &StaffChoice) -> Result<(), EngineError> {
        match staff {
            StaffChoice::Member(s) if !location.has_staff(s) => Err(EngineError::invalid(format!(
                "staff member {s} does not work at {}",
                location.id
            ))),
            _ => Ok(()),
        }
    }

    /// Fetch a record the caller is allowed to see.
    pub(super) async fn fetch_scoped(&self, scope: &Scope, id: Ulid) -> Result<Appointment, EngineError> {
        let appointment = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
        if !scope.permits(&appointment.location_id) {
            return Err(EngineError::Forbidden(id));
        }
        Ok(appointment)
    }
}

// ── Input validation ─────────────────────────────────────────────

pub(super) fn required_field(field: &str, value: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::invalid(format!("{field} is required")));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(EngineError::invalid(format!("{field} is too long")));
    }
    Ok(value.to_string())
}

pub(super) fn validate_customer(customer: &Customer) -> Result<Customer, EngineError> {
    Ok(Customer {
        name: required_field("name", &customer.name)?,
        email: required_field("email", &customer.email)?,
        phone: required_field("phone", &customer.phone)?,
    })
}

pub(super) fn validate_services(service_ids: &[String]) -> Result<Vec<String>, EngineError> {
    if service_ids.is_empty() {
        return Err(EngineError::invalid("at least one service is required"));
    }
    if service_ids.len() > MAX_SERVICES_PER_APPOINTMENT {
        return Err(EngineError::invalid("too many services"));
    }
    service_ids.iter().map(|s| required_field("service", s)).collect()
}
