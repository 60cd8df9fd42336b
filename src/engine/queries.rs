use ulid::Ulid;

use crate::limits::MAX_LIST_APPOINTMENTS;
use crate::model::*;
use crate::observability::FREE_SLOT_QUERIES_TOTAL;

use super::availability::{candidates, free_for_any, free_for_staff, within_hours};
use super::conflict::{busy_intervals, is_free};
use super::{validate_services, Engine, EngineError, Scope};

impl Engine {
    pub fn list_locations(&self) -> Vec<LocationInfo> {
        self.catalog.locations.iter().map(|l| l.info()).collect()
    }

    /// Staff in booking order.
    pub fn list_staff(&self, location_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.location(location_id)?.staff.clone())
    }

    pub fn list_services(&self, location_id: &str, language: Option<&str>) -> Result<Vec<ServiceCategory>, EngineError> {
        let location = self.location(location_id)?;
        Ok(self.catalog.categorized_services(location, language))
    }

    /// Bookable starts for the selection on `date`. `StaffChoice::Any` returns
    /// times at which at least one staff member is free.
    pub async fn free_slots(
        &self,
        location_id: &str,
        staff: &StaffChoice,
        date: CivilDate,
        service_ids: &[String],
    ) -> Result<Vec<ClockTime>, EngineError> {
        metrics::counter!(FREE_SLOT_QUERIES_TOTAL).increment(1);
        let service_ids = validate_services(service_ids)?;
        let location = self.location(location_id)?;
        Self::check_staff(location, staff)?;
        let duration = self.catalog.duration_of(location, &service_ids)?;
        let hours = self.catalog.hours_for(location, date)?;
        let cands = candidates(hours, duration);
        if cands.is_empty() {
            return Ok(cands);
        }

        let day = self.store.day(location_id, date).await?;
        let busy = busy_intervals(&self.catalog, location, &day);
        let free = match staff {
            StaffChoice::Any => free_for_any(&cands, duration, &busy, &location.staff),
            StaffChoice::Member(s) => free_for_staff(&cands, duration, &busy, s),
        };
        tracing::debug!(location = location_id, %date, duration, candidates = cands.len(), free = free.len(), "free slots");
        Ok(free)
    }

    /// Staff members, in configured order, free for the selection starting at `time`.
    pub async fn free_staff(
        &self,
        location_id: &str,
        date: CivilDate,
        time: ClockTime,
        service_ids: &[String],
    ) -> Result<Vec<String>, EngineError> {
        let service_ids = validate_services(service_ids)?;
        let location = self.location(location_id)?;
        let duration = self.catalog.duration_of(location, &service_ids)?;
        let hours = self.catalog.hours_for(location, date)?;
        let Some(span) = within_hours(hours, time, duration) else {
            return Ok(Vec::new());
        };

        let day = self.store.day(location_id, date).await?;
        let busy = busy_intervals(&self.catalog, location, &day);
        Ok(location
            .staff
            .iter()
            .filter(|s| is_free(&busy, s, span, None))
            .cloned()
            .collect())
    }

    /// Minutes the record occupies, with the same fallback the conflict check uses.
    pub fn appointment_duration(&self, appointment: &Appointment) -> Minutes {
        self.catalog
            .location(&appointment.location_id)
            .and_then(|location| self.catalog.duration_of(location, &appointment.service_ids).ok())
            .unwrap_or(self.catalog.default_duration)
    }

    pub async fn get_appointment(&self, scope: &Scope, id: Ulid) -> Result<Appointment, EngineError> {
        self.fetch_scoped(scope, id).await
    }

    /// Newest first, capped. A location scope narrows the filter to that location.
    pub async fn list_appointments(
        &self,
        scope: &Scope,
        mut filter: AppointmentFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        if let Scope::Location(own) = scope {
            if filter.location_id.as_ref().is_some_and(|l| l != own) {
                return Ok(Vec::new());
            }
            filter.location_id = Some(own.clone());
        }
        let mut found = self.store.list(&filter).await?;
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found.truncate(MAX_LIST_APPOINTMENTS);
        Ok(found)
    }
}
