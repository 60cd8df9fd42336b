use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CONFLICTS_TOTAL};

use super::assign::assign;
use super::availability::within_hours;
use super::conflict::{busy_intervals, is_free, now_ms};
use super::{
    required_field, validate_customer, validate_services, AppointmentPatch, BookingRequest, Engine, EngineError,
    LaneGuard, Scope,
};

fn record_conflict(operation: &'static str, result: &Result<Appointment, EngineError>) {
    if let Err(EngineError::Conflict { .. }) = result {
        metrics::counter!(CONFLICTS_TOTAL, "operation" => operation).increment(1);
    }
}

impl Engine {
    /// Create a Booked appointment. "Any available" is resolved to a concrete
    /// staff member under the lane lock.
    pub async fn book(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let result = self.book_inner(request).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(e) => e.kind(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        record_conflict("book", &result);
        result
    }

    async fn book_inner(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let customer = validate_customer(&request.customer)?;
        let service_ids = validate_services(&request.service_ids)?;
        let location = self.location(&request.location_id)?;
        Self::check_staff(location, &request.staff)?;
        let duration = self.catalog.duration_of(location, &service_ids)?;
        let hours = self.catalog.hours_for(location, request.date)?;
        let span = within_hours(hours, request.time, duration).ok_or_else(|| {
            EngineError::invalid(format!(
                "{} for {duration} minutes is outside opening hours on {}",
                request.time, request.date
            ))
        })?;

        let lane = LaneKey {
            location_id: location.id.clone(),
            date: request.date,
        };
        let _lane = self.lock_lanes(vec![lane]).await;

        let day = self.store.day(&location.id, request.date).await?;
        let busy = busy_intervals(&self.catalog, location, &day);
        let staff_id = match &request.staff {
            StaffChoice::Any => assign(location, &busy, span, None)
                .ok_or_else(|| EngineError::Conflict {
                    staff: StaffChoice::ANY.to_string(),
                    date: request.date,
                    time: request.time,
                })?
                .to_string(),
            StaffChoice::Member(staff) if is_free(&busy, staff, span, None) => staff.clone(),
            StaffChoice::Member(staff) => {
                return Err(EngineError::Conflict {
                    staff: staff.clone(),
                    date: request.date,
                    time: request.time,
                });
            }
        };

        let now = now_ms();
        let appointment = Appointment {
            id: Ulid::new(),
            customer,
            location_id: location.id.clone(),
            staff_id,
            date: request.date,
            time: request.time,
            service_ids,
            status: AppointmentStatus::Booked,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(appointment.clone()).await?;
        info!(
            id = %appointment.id,
            location = %appointment.location_id,
            staff = %appointment.staff_id,
            date = %appointment.date,
            time = %appointment.time,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Staff edit of any fields. Rescheduling (or re-entering Booked) runs the
    /// same checks as `book`, ignoring the record itself.
    pub async fn update_appointment(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let result = self.update_inner(scope, id, patch).await;
        record_conflict("update", &result);
        result
    }

    /// Status-only transition. Undo (Completed → Booked) can conflict.
    pub async fn set_status(&self, scope: &Scope, id: Ulid, status: AppointmentStatus) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            status: Some(status),
            ..Default::default()
        };
        let result = self.update_inner(scope, id, patch).await;
        record_conflict("set_status", &result);
        result
    }

    async fn update_inner(&self, scope: &Scope, id: Ulid, patch: AppointmentPatch) -> Result<Appointment, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::invalid("nothing to update"));
        }
        let (current, _lanes) = self.lock_record(scope, id, &patch).await?;
        if let Some(target) = &patch.location_id
            && !scope.permits(target)
        {
            return Err(EngineError::Forbidden(id));
        }
        let updated = self.apply_patch(&current, &patch).await?;
        if updated == current {
            debug!(%id, "update is a no-op");
            return Ok(current);
        }
        self.store.replace(updated.clone()).await?;
        info!(
            %id,
            location = %updated.location_id,
            staff = %updated.staff_id,
            date = %updated.date,
            time = %updated.time,
            status = %updated.status,
            "appointment updated"
        );
        Ok(updated)
    }

    /// Fetch `id` and lock its current lane and the lane the patch moves it to.
    /// Retries if the record changed lanes before the locks were taken.
    async fn lock_record(
        &self,
        scope: &Scope,
        id: Ulid,
        patch: &AppointmentPatch,
    ) -> Result<(Appointment, LaneGuard<'_>), EngineError> {
        let mut seen = self.fetch_scoped(scope, id).await?;
        loop {
            let target = LaneKey {
                location_id: patch.location_id.clone().unwrap_or_else(|| seen.location_id.clone()),
                date: patch.date.unwrap_or(seen.date),
            };
            let guard = self.lock_lanes(vec![seen.lane(), target]).await;
            let current = self.fetch_scoped(scope, id).await?;
            if current.lane() == seen.lane() {
                return Ok((current, guard));
            }
            drop(guard);
            seen = current;
        }
    }

    /// Build the edited record and validate it. Caller holds the lane locks.
    async fn apply_patch(&self, current: &Appointment, patch: &AppointmentPatch) -> Result<Appointment, EngineError> {
        let mut next = current.clone();

        if let Some(name) = &patch.name {
            next.customer.name = required_field("name", name)?;
        }
        if let Some(email) = &patch.email {
            next.customer.email = required_field("email", email)?;
        }
        if let Some(phone) = &patch.phone {
            next.customer.phone = required_field("phone", phone)?;
        }
        if let Some(status) = patch.status {
            if !current.status.can_become(status) {
                return Err(EngineError::invalid(format!(
                    "cannot change status from {} to {status}",
                    current.status
                )));
            }
            next.status = status;
        }
        if let Some(location_id) = &patch.location_id {
            next.location_id = location_id.clone();
        }
        if let Some(date) = patch.date {
            next.date = date;
        }
        if let Some(time) = patch.time {
            next.time = time;
        }
        if let Some(services) = &patch.service_ids {
            next.service_ids = validate_services(services)?;
        }

        let location = self.location(&next.location_id)?;
        let requested_staff = match &patch.staff {
            Some(choice) => choice.clone(),
            None => StaffChoice::Member(next.staff_id.clone()),
        };
        Self::check_staff(location, &requested_staff)?;
        if let StaffChoice::Member(staff) = &requested_staff {
            next.staff_id = staff.clone();
        }

        let reschedules = requested_staff == StaffChoice::Any
            || next.location_id != current.location_id
            || next.staff_id != current.staff_id
            || next.date != current.date
            || next.time != current.time
            || next.service_ids != current.service_ids
            || !current.status.blocks();
        if next.status.blocks() && reschedules {
            let duration = self.catalog.duration_of(location, &next.service_ids)?;
            let hours = self.catalog.hours_for(location, next.date)?;
            let span = within_hours(hours, next.time, duration).ok_or_else(|| {
                EngineError::invalid(format!(
                    "{} for {duration} minutes is outside opening hours on {}",
                    next.time, next.date
                ))
            })?;
            let day = self.store.day(&next.location_id, next.date).await?;
            let busy = busy_intervals(&self.catalog, location, &day);
            match &requested_staff {
                StaffChoice::Any => {
                    let staff = assign(location, &busy, span, Some(current.id)).ok_or_else(|| EngineError::Conflict {
                        staff: StaffChoice::ANY.to_string(),
                        date: next.date,
                        time: next.time,
                    })?;
                    next.staff_id = staff.to_string();
                }
                StaffChoice::Member(staff) if !is_free(&busy, staff, span, Some(current.id)) => {
                    return Err(EngineError::Conflict {
                        staff: staff.clone(),
                        date: next.date,
                        time: next.time,
                    });
                }
                StaffChoice::Member(_) => {}
            }
        } else if requested_staff == StaffChoice::Any {
            return Err(EngineError::invalid("\"any\" staff requires a Booked appointment"));
        }

        if next != *current {
            next.updated_at = now_ms().max(current.updated_at);
        }
        Ok(next)
    }

    /// Irreversible administrative removal.
    pub async fn delete_appointment(&self, scope: &Scope, id: Ulid) -> Result<(), EngineError> {
        let (current, _lanes) = self.lock_record(scope, id, &AppointmentPatch::default()).await?;
        self.store.remove(current.id).await?;
        info!(%id, location = %current.location_id, "appointment deleted");
        Ok(())
    }
}
