//! Static location and service catalog.
//!
//! Loaded once at startup (JSON) and shared read-only by the engine. Holds the
//! calendar model (per-location weekly hours) and the service duration resolver.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::model::*;

pub const DEFAULT_SERVICE_MINUTES: Minutes = 30;
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OpenHours {
    pub open: ClockTime,
    /// `24:00` allowed here for shops that close at midnight.
    #[serde(deserialize_with = "closing_time")]
    pub close: ClockTime,
}

fn closing_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ClockTime, D::Error> {
    let s = String::deserialize(deserializer)?;
    ClockTime::parse_closing(&s).map_err(serde::de::Error::custom)
}

impl OpenHours {
    pub fn span(&self) -> Span {
        Span::new(self.open.minutes(), self.close.minutes())
    }
}

/// Resolved hours for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayHours {
    Closed,
    Open(Span),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceOverride {
    pub id: String,
    #[serde(default)]
    pub price: Option<u32>,
    #[serde(default)]
    pub duration: Option<Minutes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    /// Booking order for "any available".
    pub staff: Vec<String>,
    /// Location-level default, used when `weekly` has no entry for the weekday.
    #[serde(default)]
    pub hours: Option<OpenHours>,
    /// Weekday (0 = Sunday) → hours; `null` marks the day closed.
    #[serde(default)]
    pub weekly: BTreeMap<u8, Option<OpenHours>>,
    /// Restricted subset with overrides. `None` offers the whole catalog.
    #[serde(default)]
    pub services: Option<Vec<ServiceOverride>>,
}

impl Location {
    pub fn has_staff(&self, staff_id: &str) -> bool {
        self.staff.iter().any(|s| s == staff_id)
    }

    fn service_override(&self, service_id: &str) -> Option<&ServiceOverride> {
        self.services
            .as_ref()
            .and_then(|list| list.iter().find(|o| o.id == service_id))
    }

    pub fn info(&self) -> LocationInfo {
        LocationInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            staff: self.staff.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Service {
    pub id: String,
    pub category: String,
    /// Language code → display name.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    pub duration: Minutes,
    pub price: u32,
}

impl Service {
    pub fn display_name(&self, lang: &str, fallback_lang: &str) -> String {
        self.names
            .get(lang)
            .or_else(|| self.names.get(fallback_lang))
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Outcome of looking up a recorded service id at a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedService<'a> {
    Catalog {
        service: &'a Service,
        duration: Minutes,
        price: u32,
    },
    /// Free-text value recorded before the catalog existed, or since removed.
    Legacy { id: &'a str, duration: Minutes },
}

impl ResolvedService<'_> {
    pub fn duration(&self) -> Minutes {
        match self {
            ResolvedService::Catalog { duration, .. } | ResolvedService::Legacy { duration, .. } => *duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog parse error: {0}")]
    Parse(String),
    #[error("catalog io error: {0}")]
    Io(String),
    #[error("catalog has no locations")]
    NoLocations,
    #[error("duplicate location id: {0}")]
    DuplicateLocation(String),
    #[error("duplicate service id: {0}")]
    DuplicateService(String),
    #[error("location {0} has no staff")]
    NoStaff(String),
    #[error("location {location}: duplicate staff member {staff}")]
    DuplicateStaff { location: String, staff: String },
    #[error("location {location}: invalid weekday {weekday}")]
    BadWeekday { location: String, weekday: u8 },
    #[error("location {location}: opening {open} is not before closing {close}")]
    BadHours {
        location: String,
        open: ClockTime,
        close: ClockTime,
    },
    #[error("location {location} has no hours for weekday {weekday} and no default")]
    NoHours { location: String, weekday: u8 },
    #[error("location {location} offers unknown service {service}")]
    UnknownService { location: String, service: String },
    #[error("service {id}: duration {duration} is outside 1..={max} minutes", max = MINUTES_PER_DAY)]
    BadDuration { id: String, duration: Minutes },
    #[error("empty service selection")]
    EmptySelection,
    #[error("service selection exceeds {} minutes", MINUTES_PER_DAY)]
    SelectionTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Catalog {
    /// Global default hours, last step of the override chain.
    #[serde(default)]
    pub default_hours: Option<OpenHours>,
    #[serde(default = "default_duration")]
    pub default_duration: Minutes,
    #[serde(default = "default_language")]
    pub default_language: String,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub services: Vec<Service>,
}

fn default_duration() -> Minutes {
    DEFAULT_SERVICE_MINUTES
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Single-shop catalog used when no catalog file is configured.
    pub fn builtin() -> Self {
        let ten_to_eight = OpenHours {
            open: ClockTime::on_the_hour(10),
            close: ClockTime::on_the_hour(20),
        };
        let service = |id: &str, category: &str, en: &str, el: &str, duration: Minutes, price: u32| Service {
            id: id.to_string(),
            category: category.to_string(),
            names: BTreeMap::from([("en".to_string(), en.to_string()), ("el".to_string(), el.to_string())]),
            duration,
            price,
        };
        Catalog {
            default_hours: Some(ten_to_eight),
            default_duration: DEFAULT_SERVICE_MINUTES,
            default_language: "el".to_string(),
            locations: vec![Location {
                id: "nikaia".to_string(),
                name: "Nikaia".to_string(),
                staff: vec![
                    "Νίκος Ανδρεάκος".to_string(),
                    "Στέλιος Καρλαφτόπουλος".to_string(),
                    "Γιώργος Μαχαίρας".to_string(),
                    "Δημήτρης Ξάφης".to_string(),
                ],
                hours: None,
                weekly: BTreeMap::new(),
                services: None,
            }],
            services: vec![
                service("haircut", "hair", "Haircut", "Κούρεμα", 30, 1200),
                service("kids-haircut", "hair", "Kids haircut", "Παιδικό κούρεμα", 30, 1000),
                service("beard", "beard", "Beard trim", "Περιποίηση γενειάδας", 15, 700),
                service("shave", "beard", "Hot towel shave", "Ξύρισμα", 30, 1000),
            ],
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.locations.is_empty() {
            return Err(CatalogError::NoLocations);
        }
        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id.as_str()) {
                return Err(CatalogError::DuplicateService(service.id.clone()));
            }
            check_duration(&service.id, service.duration)?;
        }
        check_duration("<default>", self.default_duration)?;
        if let Some(h) = &self.default_hours {
            check_hours("<default>", h)?;
        }

        let mut location_ids = HashSet::new();
        for loc in &self.locations {
            if !location_ids.insert(loc.id.as_str()) {
                return Err(CatalogError::DuplicateLocation(loc.id.clone()));
            }
            if loc.staff.is_empty() {
                return Err(CatalogError::NoStaff(loc.id.clone()));
            }
            let mut staff = HashSet::new();
            for member in &loc.staff {
                if !staff.insert(member.as_str()) {
                    return Err(CatalogError::DuplicateStaff {
                        location: loc.id.clone(),
                        staff: member.clone(),
                    });
                }
            }
            if let Some(h) = &loc.hours {
                check_hours(&loc.id, h)?;
            }
            for (&weekday, hours) in &loc.weekly {
                if weekday > 6 {
                    return Err(CatalogError::BadWeekday {
                        location: loc.id.clone(),
                        weekday,
                    });
                }
                if let Some(h) = hours {
                    check_hours(&loc.id, h)?;
                }
            }
            for weekday in 0..7 {
                self.weekday_hours(loc, weekday)?;
            }
            if let Some(offered) = &loc.services {
                for o in offered {
                    if !service_ids.contains(o.id.as_str()) {
                        return Err(CatalogError::UnknownService {
                            location: loc.id.clone(),
                            service: o.id.clone(),
                        });
                    }
                    if let Some(d) = o.duration {
                        check_duration(&o.id, d)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn location(&self, id: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.id == id)
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    // ── Calendar model ───────────────────────────────────────────

    /// Weekday override → location default → global default.
    fn weekday_hours(&self, location: &Location, weekday: u8) -> Result<DayHours, CatalogError> {
        let resolved = match location.weekly.get(&weekday) {
            Some(Some(h)) => Some(DayHours::Open(h.span())),
            Some(None) => Some(DayHours::Closed),
            None => location
                .hours
                .or(self.default_hours)
                .map(|h| DayHours::Open(h.span())),
        };
        resolved.ok_or_else(|| CatalogError::NoHours {
            location: location.id.clone(),
            weekday,
        })
    }

    pub fn hours_for(&self, location: &Location, date: CivilDate) -> Result<DayHours, CatalogError> {
        self.weekday_hours(location, date.weekday())
    }

    // ── Duration resolver ────────────────────────────────────────

    pub fn resolve_service<'a>(&'a self, location: &'a Location, service_id: &'a str) -> ResolvedService<'a> {
        let Some(service) = self.service(service_id) else {
            return ResolvedService::Legacy {
                id: service_id,
                duration: self.default_duration,
            };
        };
        let over = location.service_override(service_id);
        ResolvedService::Catalog {
            service,
            duration: over.and_then(|o| o.duration).unwrap_or(service.duration),
            price: over.and_then(|o| o.price).unwrap_or(service.price),
        }
    }

    /// Total minutes for an ordered selection. Unknown ids count as the default duration.
    pub fn duration_of<S: AsRef<str>>(&self, location: &Location, service_ids: &[S]) -> Result<Minutes, CatalogError> {
        if service_ids.is_empty() {
            return Err(CatalogError::EmptySelection);
        }
        service_ids.iter().try_fold(0, |total: Minutes, id| {
            let resolved = self.resolve_service(location, id.as_ref());
            if let ResolvedService::Legacy { id, duration } = &resolved {
                tracing::warn!(location = %location.id, service = %id, duration, "legacy service id, using default duration");
            }
            total
                .checked_add(resolved.duration())
                .filter(|&t| t <= MINUTES_PER_DAY)
                .ok_or(CatalogError::SelectionTooLong)
        })
    }

    // ── Listings ─────────────────────────────────────────────────

    pub fn offered_services<'a>(&'a self, location: &'a Location) -> Vec<&'a Service> {
        match &location.services {
            None => self.services.iter().collect(),
            Some(list) => list.iter().filter_map(|o| self.service(&o.id)).collect(),
        }
    }

    /// Services grouped by category, in catalog order, names in `lang`.
    pub fn categorized_services(&self, location: &Location, lang: Option<&str>) -> Vec<ServiceCategory> {
        let lang = lang.unwrap_or(&self.default_language);
        let mut categories: Vec<ServiceCategory> = Vec::new();
        for service in self.offered_services(location) {
            let ResolvedService::Catalog { duration, price, .. } = self.resolve_service(location, &service.id) else {
                continue;
            };
            let listing = ServiceListing {
                id: service.id.clone(),
                name: service.display_name(lang, &self.default_language),
                duration,
                price,
            };
            match categories.iter_mut().find(|c| c.category == service.category) {
                Some(cat) => cat.services.push(listing),
                None => categories.push(ServiceCategory {
                    category: service.category.clone(),
                    services: vec![listing],
                }),
            }
        }
        categories
    }
}

fn check_duration(id: &str, duration: Minutes) -> Result<(), CatalogError> {
    if duration == 0 || duration > MINUTES_PER_DAY {
        return Err(CatalogError::BadDuration {
            id: id.to_string(),
            duration,
        });
    }
    Ok(())
}

fn check_hours(location: &str, h: &OpenHours) -> Result<(), CatalogError> {
    if h.open >= h.close {
        return Err(CatalogError::BadHours {
            location: location.to_string(),
            open: h.open,
            close: h.close,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    const TWO_SHOPS: &str = r#"{
        "default_hours": {"open": "09:00", "close": "17:00"},
        "locations": [
            {
                "id": "A",
                "name": "Shop A",
                "staff": ["S1", "S2"],
                "hours": {"open": "10:00", "close": "20:00"},
                "weekly": {"0": null, "6": {"open": "10:00", "close": "16:00"}},
                "services": [{"id": "cut", "price": 1500}, {"id": "color", "duration": 90}]
            },
            {"id": "B", "name": "Shop B", "staff": ["S1"]}
        ],
        "services": [
            {"id": "cut", "category": "hair", "names": {"en": "Haircut", "el": "Κούρεμα"}, "duration": 30, "price": 1200},
            {"id": "beard", "category": "beard", "names": {"en": "Beard"}, "duration": 15, "price": 700},
            {"id": "color", "category": "hair", "names": {"en": "Color"}, "duration": 60, "price": 4000}
        ]
    }"#;

    fn catalog() -> Catalog {
        Catalog::from_json(TWO_SHOPS).unwrap()
    }

    fn open(from: &str, to: &str) -> DayHours {
        DayHours::Open(Span::new(time(from).minutes(), time(to).minutes()))
    }

    #[test]
    fn hours_weekday_override_wins() {
        let c = catalog();
        let a = c.location("A").unwrap();
        // 2025-01-11 is a Saturday
        assert_eq!(c.hours_for(a, date("2025-01-11")).unwrap(), open("10:00", "16:00"));
    }

    #[test]
    fn hours_closed_weekday() {
        let c = catalog();
        let a = c.location("A").unwrap();
        // 2025-01-12 is a Sunday
        assert_eq!(c.hours_for(a, date("2025-01-12")).unwrap(), DayHours::Closed);
    }

    #[test]
    fn hours_fall_back_to_location_then_global_default() {
        let c = catalog();
        let a = c.location("A").unwrap();
        let b = c.location("B").unwrap();
        assert_eq!(c.hours_for(a, date("2025-01-10")).unwrap(), open("10:00", "20:00"));
        assert_eq!(c.hours_for(b, date("2025-01-10")).unwrap(), open("09:00", "17:00"));
        assert_eq!(c.hours_for(b, date("2025-01-12")).unwrap(), open("09:00", "17:00"));
    }

    #[test]
    fn location_without_any_hours_is_rejected() {
        let json = r#"{"locations": [{"id": "A", "name": "A", "staff": ["S1"], "weekly": {"1": {"open": "10:00", "close": "12:00"}}}]}"#;
        assert!(matches!(Catalog::from_json(json), Err(CatalogError::NoHours { .. })));
    }

    #[test]
    fn midnight_closing_offers_last_slot() {
        let json = r#"{"default_hours": {"open": "22:00", "close": "24:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}]}"#;
        let c = Catalog::from_json(json).unwrap();
        let a = c.location("A").unwrap();
        assert_eq!(
            c.hours_for(a, date("2025-01-10")).unwrap(),
            DayHours::Open(Span::new(22 * 60, MINUTES_PER_DAY))
        );
        let late = r#"{"default_hours": {"open": "24:00", "close": "24:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}]}"#;
        assert!(Catalog::from_json(late).is_err());
    }

    #[test]
    fn location_with_closed_days_and_full_week_is_valid() {
        let json = r#"{"locations": [{"id": "A", "name": "A", "staff": ["S1"], "weekly": {
            "0": null, "1": null, "2": null, "3": null, "4": null, "5": null, "6": null}}]}"#;
        let c = Catalog::from_json(json).unwrap();
        let a = c.location("A").unwrap();
        assert_eq!(c.hours_for(a, date("2025-01-10")).unwrap(), DayHours::Closed);
    }

    #[test]
    fn invalid_catalogs_rejected() {
        let cases = [
            r#"{"locations": []}"#,
            r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": []}]}"#,
            r#"{"default_hours": {"open": "20:00", "close": "10:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}]}"#,
            r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1", "S1"]}]}"#,
            r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"], "weekly": {"7": null}}]}"#,
            r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"], "services": [{"id": "nope"}]}]}"#,
            r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}, {"id": "A", "name": "A2", "staff": ["S2"]}]}"#,
            r#"{"default_hours": {"open": "10:00", "close": "25:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}]}"#,
            "not json",
        ];
        for json in cases {
            assert!(Catalog::from_json(json).is_err(), "should reject: {json}");
        }
    }

    #[test]
    fn duration_sums_selection() {
        let c = catalog();
        let b = c.location("B").unwrap();
        assert_eq!(c.duration_of(b, &["cut"]).unwrap(), 30);
        assert_eq!(c.duration_of(b, &["cut", "beard"]).unwrap(), 45);
        assert_eq!(c.duration_of(b, &["cut", "beard", "color"]).unwrap(), 105);
    }

    #[test]
    fn duration_uses_location_override() {
        let c = catalog();
        let a = c.location("A").unwrap();
        let b = c.location("B").unwrap();
        assert_eq!(c.duration_of(a, &["color"]).unwrap(), 90);
        assert_eq!(c.duration_of(b, &["color"]).unwrap(), 60);
    }

    #[test]
    fn unknown_service_falls_back_to_default_duration() {
        let c = catalog();
        let a = c.location("A").unwrap();
        assert_eq!(c.duration_of(a, &["Κούρεμα + ξύρισμα"]).unwrap(), DEFAULT_SERVICE_MINUTES);
        assert_eq!(c.duration_of(a, &["cut", "mystery"]).unwrap(), 60);
        assert!(matches!(c.resolve_service(a, "mystery"), ResolvedService::Legacy { .. }));
    }

    #[test]
    fn out_of_range_durations_rejected() {
        let base = r#"{"default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]DURATION_OVERRIDE}], "services": [{"id": "big", "category": "x", "names": {}, "duration": SERVICE_MINUTES, "price": 0}]}"#;
        let build = |service: &str, over: &str| base.replace("SERVICE_MINUTES", service).replace("DURATION_OVERRIDE", over);

        assert!(Catalog::from_json(&build("1440", "")).is_ok());
        for json in [
            build("4000000000", ""),
            build("1441", ""),
            build("0", ""),
            build("30", r#", "services": [{"id": "big", "duration": 5000}]"#),
        ] {
            assert!(
                matches!(Catalog::from_json(&json), Err(CatalogError::BadDuration { .. })),
                "should reject: {json}"
            );
        }
        let huge_default = r#"{"default_duration": 100000, "default_hours": {"open": "10:00", "close": "20:00"}, "locations": [{"id": "A", "name": "A", "staff": ["S1"]}]}"#;
        assert!(matches!(
            Catalog::from_json(huge_default),
            Err(CatalogError::BadDuration { .. })
        ));
    }

    #[test]
    fn selection_longer_than_a_day_is_an_error() {
        let c = catalog();
        let a = c.location("A").unwrap();
        let many = ["color"; 17];
        assert_eq!(c.duration_of(a, &many), Err(CatalogError::SelectionTooLong));
    }

    #[test]
    fn empty_selection_is_an_error() {
        let c = catalog();
        let a = c.location("A").unwrap();
        let none: [&str; 0] = [];
        assert_eq!(c.duration_of(a, &none), Err(CatalogError::EmptySelection));
    }

    #[test]
    fn categorized_services_respect_subset_and_overrides() {
        let c = catalog();
        let a = c.location("A").unwrap();
        let cats = c.categorized_services(a, Some("el"));
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].category, "hair");
        let cut = &cats[0].services[0];
        assert_eq!(cut.name, "Κούρεμα");
        assert_eq!(cut.price, 1500);
        let color = &cats[0].services[1];
        assert_eq!(color.name, "Color"); // falls back to default language
        assert_eq!(color.duration, 90);
    }

    #[test]
    fn categorized_services_full_catalog_in_order() {
        let c = catalog();
        let b = c.location("B").unwrap();
        let cats = c.categorized_services(b, None);
        let names: Vec<_> = cats.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, vec!["hair", "beard"]);
        assert_eq!(cats[0].services.len(), 2);
    }

    #[test]
    fn builtin_catalog_is_valid() {
        let c = Catalog::builtin();
        c.validate().unwrap();
        let shop = c.location("nikaia").unwrap();
        assert_eq!(shop.staff.len(), 4);
        assert_eq!(c.hours_for(shop, date("2025-01-12")).unwrap(), open("10:00", "20:00"));
    }
}
