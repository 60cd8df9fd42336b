use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — used for record timestamps only.
pub type Ms = i64;

/// Minutes since local midnight, or a duration in minutes.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Half-open interval `[start, end)` in minutes of one civil day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn starting_at(start: ClockTime, duration: Minutes) -> Self {
        Self::new(start.minutes(), start.minutes() + duration)
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Wall-clock time ──────────────────────────────────────────────

/// `HH:MM` wall-clock time, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(Minutes);

impl ClockTime {
    pub fn from_minutes(minutes: Minutes) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    /// Whole hour, wrapped into `0..24`.
    pub const fn on_the_hour(hour: u32) -> Self {
        Self((hour % 24) * 60)
    }

    pub fn minutes(self) -> Minutes {
        self.0
    }

    /// Like `from_str`, but also accepts `24:00` as the end of the day.
    /// Only valid as a closing time; never a bookable start.
    pub fn parse_closing(s: &str) -> Result<Self, FormatError> {
        if s == "24:00" {
            return Ok(Self(MINUTES_PER_DAY));
        }
        s.parse()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for ClockTime {
    type Err = FormatError;

    /// Strict `HH:MM`, 24h, two digits each.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(FormatError::Time(s.to_string()));
        }
        let digits = |a: u8, b: u8| -> Option<u32> {
            (a.is_ascii_digit() && b.is_ascii_digit())
                .then(|| u32::from(a - b'0') * 10 + u32::from(b - b'0'))
        };
        let hour = digits(bytes[0], bytes[1]);
        let minute = digits(bytes[3], bytes[4]);
        match (hour, minute) {
            (Some(h), Some(m)) => ClockTime::hm(h, m).ok_or_else(|| FormatError::Time(s.to_string())),
            _ => Err(FormatError::Time(s.to_string())),
        }
    }
}

impl TryFrom<String> for ClockTime {
    type Error = FormatError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClockTime> for String {
    fn from(t: ClockTime) -> String {
        t.to_string()
    }
}

// ── Civil date ───────────────────────────────────────────────────

/// `YYYY-MM-DD` calendar date in the location's own civil calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CivilDate(NaiveDate);

impl CivilDate {
    /// 0 = Sunday … 6 = Saturday.
    pub fn weekday(self) -> u8 {
        self.0.weekday().num_days_from_sunday() as u8
    }
}

impl fmt::Display for CivilDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for CivilDate {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let shape_ok = s.len() == 10
            && s.bytes()
                .enumerate()
                .all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() });
        if !shape_ok {
            return Err(FormatError::Date(s.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(CivilDate)
            .map_err(|_| FormatError::Date(s.to_string()))
    }
}

impl TryFrom<String> for CivilDate {
    type Error = FormatError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CivilDate> for String {
    fn from(d: CivilDate) -> String {
        d.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid date format: {0:?} (expected YYYY-MM-DD)")]
    Date(String),
    #[error("invalid time format: {0:?} (expected HH:MM)")]
    Time(String),
    #[error("invalid status: {0:?}")]
    Status(String),
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Only Booked appointments occupy their interval.
    pub fn blocks(self) -> bool {
        self == AppointmentStatus::Booked
    }

    /// `Booked ⇄ Completed`, `Booked → Cancelled`. Staying put is always allowed.
    pub fn can_become(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Booked, Booked)
                | (Completed, Completed)
                | (Cancelled, Cancelled)
                | (Booked, Completed)
                | (Booked, Cancelled)
                | (Completed, Booked)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "booked" => Ok(AppointmentStatus::Booked),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            _ => Err(FormatError::Status(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Staff selection on a request. `Any` never reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaffChoice {
    Any,
    Member(String),
}

impl StaffChoice {
    pub const ANY: &'static str = "any";

    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(Self::ANY) {
            StaffChoice::Any
        } else {
            StaffChoice::Member(trimmed.to_string())
        }
    }
}

/// Serialization key for concurrent writers: one location on one date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LaneKey {
    pub location_id: String,
    pub date: CivilDate,
}

/// Uniqueness key enforced by stores over Booked records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub location_id: String,
    pub staff_id: String,
    pub date: CivilDate,
    pub time: ClockTime,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {} {}", self.location_id, self.staff_id, self.date, self.time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer: Customer,
    pub location_id: String,
    pub staff_id: String,
    pub date: CivilDate,
    pub time: ClockTime,
    /// Ordered as selected by the customer.
    pub service_ids: Vec<String>,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn lane(&self) -> LaneKey {
        LaneKey {
            location_id: self.location_id.clone(),
            date: self.date,
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            location_id: self.location_id.clone(),
            staff_id: self.staff_id.clone(),
            date: self.date,
            time: self.time,
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked { appointment: Appointment },
    AppointmentUpdated { appointment: Appointment },
    AppointmentDeleted { id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub id: String,
    pub name: String,
    pub staff: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceListing {
    pub id: String,
    pub name: String,
    pub duration: Minutes,
    pub price: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCategory {
    pub category: String,
    pub services: Vec<ServiceListing>,
}

/// Admin listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub location_id: Option<String>,
    pub staff_id: Option<String>,
    pub date: Option<CivilDate>,
    pub status: Option<AppointmentStatus>,
}

impl AppointmentFilter {
    pub fn matches(&self, appt: &Appointment) -> bool {
        self.location_id.as_ref().is_none_or(|l| *l == appt.location_id)
            && self.staff_id.as_ref().is_none_or(|s| *s == appt.staff_id)
            && self.date.is_none_or(|d| d == appt.date)
            && self.status.is_none_or(|s| s == appt.status)
    }
}
