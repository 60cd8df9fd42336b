use ulid::Ulid;

use crate::catalog::Location;
use crate::model::Span;

use super::conflict::{is_free, Busy};

/// First staff member, in configured order, free for `span`.
/// `exclude` skips the record being edited.
pub fn assign<'a>(location: &'a Location, busy: &[Busy<'_>], span: Span, exclude: Option<Ulid>) -> Option<&'a str> {
    location
        .staff
        .iter()
        .map(String::as_str)
        .find(|staff| is_free(busy, staff, span, exclude))
}
