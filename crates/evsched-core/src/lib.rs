//! Core domain model for the event schedule sync.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "evsched-core";

/// Display format used for every rendered timestamp written to the store.
pub const DISPLAY_DATE_FORMAT: &str = "%m/%d/%Y %I:%M%p";

/// Marker attached to an event by the schedule markup.
///
/// Variant order is the order tags are rendered in the store's `Tags` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tag {
    New,
    PS4,
    Xbox,
    Collab,
}

impl Tag {
    pub const ALL: [Tag; 4] = [Tag::New, Tag::PS4, Tag::Xbox, Tag::Collab];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::New => "New",
            Tag::PS4 => "PS4",
            Tag::Xbox => "Xbox",
            Tag::Collab => "Collab",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tag `{0}`")]
pub struct TagParseError(pub String);

impl FromStr for Tag {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Tag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| TagParseError(trimmed.to_string()))
    }
}

/// Renders a tag set the way the store's `Tags` column holds it.
pub fn join_tags(tags: &BTreeSet<Tag>) -> String {
    tags.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One normalized schedule entry, rebuilt from source markup on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub source_id: String,
    pub title: String,
    pub description: String,
    pub level: String,
    pub start_date: String,
    pub end_date: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub tags: BTreeSet<Tag>,
}

impl EventRecord {
    pub fn tags_display(&self) -> String {
        join_tags(&self.tags)
    }

    pub fn has_any_tag(&self, tags: &BTreeSet<Tag>) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised timezone `{0}`")]
pub struct ZoneParseError(pub String);

/// Timezone dates are rendered in: either a fixed UTC offset or a named IANA zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl TargetZone {
    pub fn utc() -> Self {
        TargetZone::Fixed(FixedOffset::east_opt(0).expect("zero offset is in range"))
    }

    pub fn format_instant(&self, instant: DateTime<Utc>, fmt: &str) -> String {
        match self {
            TargetZone::Fixed(offset) => instant.with_timezone(offset).format(fmt).to_string(),
            TargetZone::Named(tz) => instant.with_timezone(tz).format(fmt).to_string(),
        }
    }

    /// Calendar date of `instant` as seen from this zone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            TargetZone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            TargetZone::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }
}

impl fmt::Display for TargetZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetZone::Fixed(offset) => write!(f, "{offset}"),
            TargetZone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

impl FromStr for TargetZone {
    type Err = ZoneParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ZoneParseError(s.to_string()));
        }
        if matches!(trimmed, "Z" | "UTC" | "GMT") {
            return Ok(TargetZone::utc());
        }
        let offset_text = trimmed
            .strip_prefix("UTC")
            .or_else(|| trimmed.strip_prefix("GMT"))
            .unwrap_or(trimmed);
        if offset_text.starts_with(['+', '-']) {
            return parse_fixed_offset(offset_text)
                .map(TargetZone::Fixed)
                .ok_or_else(|| ZoneParseError(trimmed.to_string()));
        }
        trimmed
            .parse::<Tz>()
            .map(TargetZone::Named)
            .map_err(|_| ZoneParseError(trimmed.to_string()))
    }
}

/// Parses `±H`, `±HH`, `±HHMM` and `±HH:MM`.
fn parse_fixed_offset(text: &str) -> Option<FixedOffset> {
    let (sign, rest) = match text.split_at(1) {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit() || c == ':') {
        return None;
    }
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) if (1..=2).contains(&h.len()) && m.len() == 2 => (h, m),
        Some(_) => return None,
        None if rest.len() <= 2 => (rest, "0"),
        None if rest.len() == 4 => rest.split_at(2),
        None => return None,
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Validated run configuration read from the store's `Config` sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    pub timezone: TargetZone,
    pub ignore_tags: BTreeSet<Tag>,
}

impl EventConfig {
    pub fn is_ignored(&self, event: &EventRecord) -> bool {
        event.has_any_tag(&self.ignore_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tags_parse_case_insensitively_and_render_in_declared_order() {
        assert_eq!("ps4".parse::<Tag>(), Ok(Tag::PS4));
        assert_eq!(" Collab ".parse::<Tag>(), Ok(Tag::Collab));
        assert!("Switch".parse::<Tag>().is_err());

        let tags: BTreeSet<Tag> = [Tag::Collab, Tag::New, Tag::Xbox].into_iter().collect();
        assert_eq!(join_tags(&tags), "New, Xbox, Collab");
        assert_eq!(join_tags(&BTreeSet::new()), "");
    }

    #[test]
    fn target_zone_accepts_offsets_and_iana_names() {
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!("-05:00".parse::<TargetZone>(), Ok(TargetZone::Fixed(minus_five)));
        assert_eq!("-5".parse::<TargetZone>(), Ok(TargetZone::Fixed(minus_five)));
        assert_eq!("GMT-0500".parse::<TargetZone>(), Ok(TargetZone::Fixed(minus_five)));
        assert_eq!("Z".parse::<TargetZone>(), Ok(TargetZone::utc()));
        assert_eq!(
            "America/New_York".parse::<TargetZone>(),
            Ok(TargetZone::Named(chrono_tz::America::New_York))
        );
        assert!("".parse::<TargetZone>().is_err());
        assert!("+5:7".parse::<TargetZone>().is_err());
        assert!("Mars/Olympus".parse::<TargetZone>().is_err());
    }

    #[test]
    fn target_zone_renders_in_display_format() {
        let instant = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).single().unwrap();
        let zone: TargetZone = "-05:00".parse().unwrap();
        assert_eq!(zone.format_instant(instant, DISPLAY_DATE_FORMAT), "08/31/2024 07:00PM");
        assert_eq!(zone.local_date(instant), NaiveDate::from_ymd_opt(2024, 8, 31).unwrap());

        let tokyo: TargetZone = "Asia/Tokyo".parse().unwrap();
        assert_eq!(tokyo.format_instant(instant, DISPLAY_DATE_FORMAT), "09/01/2024 09:00AM");
    }

    #[test]
    fn config_ignores_records_sharing_any_tag() {
        let config = EventConfig {
            timezone: TargetZone::utc(),
            ignore_tags: [Tag::Xbox].into_iter().collect(),
        };
        let instant = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).single().unwrap();
        let mut event = EventRecord {
            source_id: "base-schedule".into(),
            title: "Quest".into(),
            description: String::new(),
            level: "9★".into(),
            start_date: String::new(),
            end_date: String::new(),
            starts_at: instant,
            ends_at: instant,
            tags: BTreeSet::new(),
        };
        assert!(!config.is_ignored(&event));
        event.tags = [Tag::New, Tag::Xbox].into_iter().collect();
        assert!(config.is_ignored(&event));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tags"], serde_json::json!(["New", "Xbox"]));
    }
}
