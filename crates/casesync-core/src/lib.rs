//! Core domain model + numeric/date normalization for the case sync pipeline.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "casesync-core";

/// One synchronized feed. Two feeds target Victoria; they are distinct
/// regions as far as the pipeline is concerned because they differ in
/// retrieval mechanism and schema, not just state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    Nsw,
    VicSheet,
    VicDashboard,
    Wa,
}

impl Region {
    pub fn slug(&self) -> &'static str {
        match self {
            Region::Nsw => "nsw",
            Region::VicSheet => "vic-sheet",
            Region::VicDashboard => "vic-dashboard",
            Region::Wa => "wa",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "nsw" => Some(Region::Nsw),
            "vic-sheet" => Some(Region::VicSheet),
            "vic-dashboard" => Some(Region::VicDashboard),
            "wa" => Some(Region::Wa),
            _ => None,
        }
    }

    /// The `STE_NAME16` value canonical features must carry to be eligible
    /// for this region's updates.
    pub fn state_name(&self) -> &'static str {
        match self {
            Region::Nsw => "New South Wales",
            Region::VicSheet | Region::VicDashboard => "Victoria",
            Region::Wa => "Western Australia",
        }
    }

    pub fn key_field(&self) -> KeyField {
        match self {
            Region::Nsw | Region::Wa => KeyField::LgaCode,
            Region::VicSheet | Region::VicDashboard => KeyField::LgaName,
        }
    }
}

/// Which canonical attribute a region's source records join on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyField {
    LgaCode,
    LgaName,
}

/// One administrative area as held by the feature store. Read-only for the
/// duration of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalFeature {
    pub object_id: i64,
    pub lga_code: String,
    pub lga_name: String,
    pub state_name: String,
}

impl CanonicalFeature {
    pub fn key(&self, field: KeyField) -> &str {
        match field {
            KeyField::LgaCode => &self.lga_code,
            KeyField::LgaName => &self.lga_name,
        }
    }
}

/// A raw case figure as published: either a plain count or a display string
/// such as `"1,234"` or `"10-20"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseLabel {
    Count(i64),
    Text(String),
}

impl CaseLabel {
    /// The machine-usable count behind the label, midpoint-resolved for
    /// range strings.
    pub fn resolve_count(&self) -> Option<i64> {
        match self {
            CaseLabel::Count(n) => Some(*n),
            CaseLabel::Text(s) => resolve_midpoint(s),
        }
    }

    /// A zero count or empty string carries no signal in the published
    /// feeds and is treated the same as an absent figure.
    pub fn is_blank(&self) -> bool {
        match self {
            CaseLabel::Count(n) => *n == 0,
            CaseLabel::Text(s) => s.is_empty(),
        }
    }
}

/// The common record shape every region adapter flattens its feed into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub key: String,
    pub cases: Option<i64>,
    pub cases_display: Option<CaseLabel>,
    pub as_of: NaiveDate,
}

/// A store-ready attribute update, produced by matching a source record to
/// a canonical feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub object_id: i64,
    pub cases: Option<i64>,
    pub cases_str: Option<CaseLabel>,
    pub last_updated: String,
}

/// Per-record result of a batched edit call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub object_id: i64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EditFailure>,
}

/// Detail attached to a rejected edit. Stores report either a
/// code/description object or a bare message string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EditFailure {
    Detail {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        description: Option<String>,
    },
    Message(String),
}

impl EditFailure {
    pub fn description(&self) -> Option<&str> {
        match self {
            EditFailure::Detail { description, .. } => description.as_deref(),
            EditFailure::Message(msg) => Some(msg),
        }
    }
}

/// Strip comma thousands separators and parse an integer count. `None` for
/// empty or unparseable input.
pub fn parse_count(value: &str) -> Option<i64> {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<i64>().ok()
}

/// Resolve a raw case figure to a single count. Hyphenated ranges `"a-b"`
/// resolve to the floor of the arithmetic midpoint; everything else defers
/// to [`parse_count`].
pub fn resolve_midpoint(value: &str) -> Option<i64> {
    match value.split_once('-') {
        Some((lo, hi)) => {
            let lo = parse_count(lo)?;
            let hi = parse_count(hi)?;
            Some((lo + hi).div_euclid(2))
        }
        None => parse_count(value),
    }
}

/// Parse a `DD/MM/YYYY` calendar date.
pub fn parse_day_month_year(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%d/%m/%Y").ok()
}

/// Parse the leading calendar date of an ISO `YYYY-MM-DD` date or RFC 3339
/// timestamp. Timestamps are read as their UTC calendar date.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let head = value.trim().split(['T', ' ']).next()?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Format a date the way the feature store's downstream consumers expect:
/// `YYYY-M-D`, month and day never zero-padded.
pub fn esri_date(date: NaiveDate) -> String {
    format!("{}-{}-{}", date.year(), date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_parsing_strips_thousands_separators() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("1,234,567"), Some(1234567));
        assert_eq!(parse_count("42"), Some(42));
        assert_eq!(parse_count(" 7 "), Some(7));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("n/a"), None);
    }

    #[test]
    fn range_resolves_to_floor_of_midpoint() {
        assert_eq!(resolve_midpoint("10-20"), Some(15));
        assert_eq!(resolve_midpoint("10-21"), Some(15));
        assert_eq!(resolve_midpoint("0-1"), Some(0));
        assert_eq!(resolve_midpoint("1,000-2,000"), Some(1500));
        assert_eq!(resolve_midpoint("15"), Some(15));
        assert_eq!(resolve_midpoint("1,234"), Some(1234));
        assert_eq!(resolve_midpoint("10-"), None);
    }

    #[test]
    fn day_month_year_parsing() {
        assert_eq!(
            parse_day_month_year("03/03/2021"),
            NaiveDate::from_ymd_opt(2021, 3, 3)
        );
        assert_eq!(
            parse_day_month_year("31/12/2020"),
            NaiveDate::from_ymd_opt(2020, 12, 31)
        );
        assert_eq!(parse_day_month_year("2021-03-03"), None);
    }

    #[test]
    fn iso_date_parsing_accepts_dates_and_timestamps() {
        assert_eq!(
            parse_iso_date("2020-03-25"),
            NaiveDate::from_ymd_opt(2020, 3, 25)
        );
        assert_eq!(
            parse_iso_date("2020-07-21T01:54:28.732Z"),
            NaiveDate::from_ymd_opt(2020, 7, 21)
        );
        assert_eq!(parse_iso_date("25/03/2020"), None);
    }

    #[test]
    fn store_dates_are_never_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 3).unwrap();
        assert_eq!(esri_date(date), "2021-3-3");
        let date = NaiveDate::from_ymd_opt(2020, 12, 25).unwrap();
        assert_eq!(esri_date(date), "2020-12-25");
    }

    #[test]
    fn case_label_resolves_counts_and_ranges() {
        assert_eq!(CaseLabel::Count(12).resolve_count(), Some(12));
        assert_eq!(CaseLabel::Text("10-20".into()).resolve_count(), Some(15));
        assert_eq!(CaseLabel::Text("1,234".into()).resolve_count(), Some(1234));
        assert_eq!(CaseLabel::Text("unknown".into()).resolve_count(), None);
    }

    #[test]
    fn blank_labels_mirror_source_truthiness() {
        assert!(CaseLabel::Count(0).is_blank());
        assert!(CaseLabel::Text(String::new()).is_blank());
        assert!(!CaseLabel::Count(1).is_blank());
        assert!(!CaseLabel::Text("10-20".into()).is_blank());
    }

    #[test]
    fn case_label_serializes_untagged() {
        assert_eq!(
            serde_json::to_string(&CaseLabel::Count(15)).unwrap(),
            "15"
        );
        assert_eq!(
            serde_json::to_string(&CaseLabel::Text("10-20".into())).unwrap(),
            "\"10-20\""
        );
        let parsed: CaseLabel = serde_json::from_str("\"1,234\"").unwrap();
        assert_eq!(parsed, CaseLabel::Text("1,234".into()));
        let parsed: CaseLabel = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, CaseLabel::Count(7));
    }

    #[test]
    fn region_slugs_round_trip() {
        for region in [
            Region::Nsw,
            Region::VicSheet,
            Region::VicDashboard,
            Region::Wa,
        ] {
            assert_eq!(Region::from_slug(region.slug()), Some(region));
        }
        assert_eq!(Region::from_slug("tas"), None);
    }

    #[test]
    fn canonical_key_selects_per_region_field() {
        let feature = CanonicalFeature {
            object_id: 9,
            lga_code: "17200".into(),
            lga_name: "Sydney (C)".into(),
            state_name: "New South Wales".into(),
        };
        assert_eq!(feature.key(KeyField::LgaCode), "17200");
        assert_eq!(feature.key(KeyField::LgaName), "Sydney (C)");
    }
}
