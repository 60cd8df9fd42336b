use ulid::Ulid;

use crate::catalog::{Catalog, Location};
use crate::model::*;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open overlap of `[a, a+da)` and `[b, b+db)`. Touching intervals do not overlap.
pub fn overlaps(start_a: Minutes, dur_a: Minutes, start_b: Minutes, dur_b: Minutes) -> bool {
    start_a < start_b + dur_b && start_b < start_a + dur_a
}

/// Interval occupied by one Booked appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Busy<'a> {
    pub id: Ulid,
    pub staff_id: &'a str,
    pub span: Span,
}

/// Busy intervals of the Booked records in one location/day fetch. Durations
/// are resolved from each record's own service list.
pub(crate) fn busy_intervals<'a>(catalog: &Catalog, location: &Location, day: &'a [Appointment]) -> Vec<Busy<'a>> {
    day.iter()
        .filter(|a| a.status.blocks())
        .map(|a| {
            let duration = catalog.duration_of(location, &a.service_ids).unwrap_or_else(|_| {
                tracing::warn!(id = %a.id, "appointment without services, using default duration");
                catalog.default_duration
            });
            Busy {
                id: a.id,
                staff_id: a.staff_id.as_str(),
                span: Span::starting_at(a.time, duration),
            }
        })
        .collect()
}

/// True if `staff_id` has no busy interval overlapping `span`, ignoring `exclude`.
pub(crate) fn is_free(busy: &[Busy<'_>], staff_id: &str, span: Span, exclude: Option<Ulid>) -> bool {
    !busy.iter().any(|b| {
        b.staff_id == staff_id
            && Some(b.id) != exclude
            && overlaps(b.span.start, b.span.duration(), span.start, span.duration())
    })
}
