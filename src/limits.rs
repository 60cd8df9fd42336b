/// Services on one appointment.
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 16;
/// Customer name/email/phone and identifier lengths, in bytes.
pub const MAX_FIELD_LEN: usize = 256;
/// Rows returned by one appointment listing.
pub const MAX_LIST_APPOINTMENTS: usize = 10_000;
/// Raw SQL accepted on the wire.
pub const MAX_SQL_LEN: usize = 64 * 1024;
