use crate::catalog::DayHours;
use crate::model::*;

use super::conflict::{is_free, Busy};

// ── Slot candidates ───────────────────────────────────────────────

/// Step between candidate starts: half-hours when the duration divides evenly,
/// quarter-hours otherwise.
pub fn granularity(duration: Minutes) -> Minutes {
    if duration % 30 == 0 { 30 } else { 15 }
}

/// Ordered legal starts for `duration` within the day's hours, no conflict checks.
/// The last candidate ends exactly at closing.
pub fn candidates(hours: DayHours, duration: Minutes) -> Vec<ClockTime> {
    let DayHours::Open(span) = hours else {
        return Vec::new();
    };
    if duration == 0 || duration > span.duration() {
        return Vec::new();
    }
    (span.start..=span.end - duration)
        .step_by(granularity(duration) as usize)
        .filter_map(ClockTime::from_minutes)
        .collect()
}

/// The interval `[time, time+duration)` if it lies within the day's hours.
pub(crate) fn within_hours(hours: DayHours, time: ClockTime, duration: Minutes) -> Option<Span> {
    let DayHours::Open(open) = hours else {
        return None;
    };
    let wanted = Span::starting_at(time, duration);
    open.contains_span(&wanted).then_some(wanted)
}

// ── Free-slot filtering ───────────────────────────────────────────

/// Candidates at which `staff_id` is free.
pub(crate) fn free_for_staff(candidates: &[ClockTime], duration: Minutes, busy: &[Busy<'_>], staff_id: &str) -> Vec<ClockTime> {
    candidates
        .iter()
        .copied()
        .filter(|t| is_free(busy, staff_id, Span::starting_at(*t, duration), None))
        .collect()
}

/// Candidates at which at least one of `staff` is free, in candidate order.
pub(crate) fn free_for_any(candidates: &[ClockTime], duration: Minutes, busy: &[Busy<'_>], staff: &[String]) -> Vec<ClockTime> {
    candidates
        .iter()
        .copied()
        .filter(|t| {
            let span = Span::starting_at(*t, duration);
            staff.iter().any(|s| is_free(busy, s, span, None))
        })
        .collect()
}
