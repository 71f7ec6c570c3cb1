//! Core domain model for fireperim: upstream perimeter records, the reduced
//! per-mission set, and the fixed-offset Pacific date rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "fireperim-core";

pub const ATTR_MISSION: &str = "mission";
pub const ATTR_OBJECT_ID: &str = "OBJECTID";
pub const ATTR_SOURCE: &str = "source";
pub const ATTR_INCIDENT_NAME: &str = "incident_name";
pub const ATTR_INCIDENT_NUMBER: &str = "incident_number";
pub const ATTR_AREA_ACRES: &str = "area_acres";
pub const ATTR_DESCRIPTION: &str = "description";
pub const ATTR_DATE_CURRENT: &str = "poly_DateCurrent";

/// One closed ring of `[x, y]` (optionally `[x, y, z]`) positions.
pub type Ring = Vec<Vec<f64>>;

/// Esri polygon geometry. Ring 0 is the outer boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolygonGeometry {
    #[serde(default)]
    pub rings: Vec<Ring>,
}

/// One upstream feature record as returned by the feature service query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
    #[serde(default)]
    pub geometry: Option<PolygonGeometry>,
}

impl RawFeature {
    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    /// Dedup key. Only string values qualify; non-string missions are skipped.
    pub fn mission(&self) -> Option<String> {
        self.attribute(ATTR_MISSION)?.as_str().map(str::to_string)
    }

    pub fn object_id(&self) -> Option<i64> {
        self.attribute(ATTR_OBJECT_ID)?.as_i64()
    }

    /// Display text for an attribute; absent and null both become `""`.
    pub fn attribute_text(&self, name: &str) -> String {
        match self.attribute(name) {
            None => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    pub fn rings(&self) -> &[Ring] {
        self.geometry
            .as_ref()
            .map(|g| g.rings.as_slice())
            .unwrap_or_default()
    }
}

/// Newest feature per mission for one poll cycle, iterated in mission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducedFeatureSet {
    by_mission: BTreeMap<String, RawFeature>,
}

impl ReducedFeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_mission.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mission.is_empty()
    }

    pub fn get(&self, mission: &str) -> Option<&RawFeature> {
        self.by_mission.get(mission)
    }

    pub fn insert(&mut self, mission: String, feature: RawFeature) -> Option<RawFeature> {
        self.by_mission.insert(mission, feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawFeature)> {
        self.by_mission.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub const DATE_ABSENT: &str = "None";
pub const DATE_NEGATIVE: &str = "Invalid Date";
pub const DATE_UNCONVERTIBLE: &str = " ";

const PACIFIC_DAYLIGHT_OFFSET_HOURS: i64 = 7;
const PACIFIC_STANDARD_OFFSET_HOURS: i64 = 8;
const PACIFIC_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const MAX_CALENDAR_YEAR: i32 = 9999;

/// Renders an epoch-millisecond attribute as Pacific wall time.
///
/// Returns [`DATE_ABSENT`] for a missing or falsy value (`null`, `0`, `""`,
/// `false`), [`DATE_NEGATIVE`] for a negative number and
/// [`DATE_UNCONVERTIBLE`] for anything that is not a usable instant.
pub fn format_pacific(value: Option<&JsonValue>) -> String {
    let Some(value) = value.filter(|v| is_truthy(v)) else {
        return DATE_ABSENT.to_string();
    };
    let Some(millis) = value.as_f64() else {
        return DATE_UNCONVERTIBLE.to_string();
    };
    if millis < 0.0 {
        return DATE_NEGATIVE.to_string();
    }
    match pacific_wall_time(millis) {
        Some(local) => local.format(PACIFIC_DATE_FORMAT).to_string(),
        None => DATE_UNCONVERTIBLE.to_string(),
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn pacific_wall_time(millis: f64) -> Option<NaiveDateTime> {
    let millis = millis.trunc();
    if !millis.is_finite() || millis >= i64::MAX as f64 {
        return None;
    }
    let utc = DateTime::from_timestamp_millis(millis as i64)?.naive_utc();
    if utc.year() > MAX_CALENDAR_YEAR {
        return None;
    }
    let offset = if in_pacific_dst(utc) {
        PACIFIC_DAYLIGHT_OFFSET_HOURS
    } else {
        PACIFIC_STANDARD_OFFSET_HOURS
    };
    utc.checked_sub_signed(TimeDelta::hours(offset))
}

/// DST window for `year`: midnight of the second Sunday of March up to
/// (excluding) midnight of the first Sunday of November.
pub fn pacific_dst_window(year: i32) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = nth_sunday(year, 3, 2)?.and_hms_opt(0, 0, 0)?;
    let end = nth_sunday(year, 11, 1)?.and_hms_opt(0, 0, 0)?;
    Some((start, end))
}

/// Compared against the naive UTC wall time, not a local instant.
pub fn in_pacific_dst(utc: NaiveDateTime) -> bool {
    pacific_dst_window(utc.year()).is_some_and(|(start, end)| start <= utc && utc < end)
}

fn nth_sunday(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let to_sunday = (6 + 7 - first.weekday().num_days_from_monday()) % 7;
    NaiveDate::from_ymd_opt(year, month, 1 + to_sunday + 7 * (n - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn millis(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("valid utc timestamp")
            .timestamp_millis()
    }

    #[test]
    fn summer_timestamp_uses_daylight_offset() {
        let v = json!(millis(2024, 7, 15, 12, 0, 0));
        assert_eq!(format_pacific(Some(&v)), "2024-07-15 05:00:00");
    }

    #[test]
    fn winter_timestamp_uses_standard_offset() {
        let v = json!(millis(2024, 1, 15, 12, 0, 0));
        assert_eq!(format_pacific(Some(&v)), "2024-01-15 04:00:00");
    }

    #[test]
    fn sentinels_stay_distinct() {
        assert_eq!(format_pacific(None), "None");
        assert_eq!(format_pacific(Some(&JsonValue::Null)), "None");
        assert_eq!(format_pacific(Some(&json!(""))), "None");
        assert_eq!(format_pacific(Some(&json!(-1))), "Invalid Date");
        assert_eq!(format_pacific(Some(&json!("yesterday"))), " ");
        assert_eq!(format_pacific(Some(&json!([1, 2]))), " ");
    }

    #[test]
    fn instants_past_year_9999_are_unconvertible() {
        let last = json!(millis(9999, 12, 31, 23, 59, 59));
        assert_eq!(format_pacific(Some(&last)), "9999-12-31 15:59:59");

        let v = json!(253_402_300_800_000i64);
        assert_eq!(format_pacific(Some(&v)), DATE_UNCONVERTIBLE);
    }

    #[test]
    fn fractional_millis_are_truncated() {
        let v = json!(millis(2024, 1, 15, 12, 0, 0) as f64 + 999.9);
        assert_eq!(format_pacific(Some(&v)), "2024-01-15 04:00:00");
    }

    #[test]
    fn dst_window_matches_known_years() {
        let (start, end) = pacific_dst_window(2024).expect("window");
        assert_eq!(start.date(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2024, 11, 3).unwrap());

        // March 1st 2026 is itself a Sunday.
        let (start, end) = pacific_dst_window(2026).expect("window");
        assert_eq!(start.date(), NaiveDate::from_ymd_opt(2026, 3, 8).unwrap());
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2026, 11, 1).unwrap());
    }

    #[test]
    fn dst_boundaries_compare_against_utc_wall_time() {
        let before = json!(millis(2024, 3, 9, 23, 59, 59));
        let at_start = json!(millis(2024, 3, 10, 0, 0, 0));
        let at_end = json!(millis(2024, 11, 3, 0, 0, 0));
        assert_eq!(format_pacific(Some(&before)), "2024-03-09 15:59:59");
        assert_eq!(format_pacific(Some(&at_start)), "2024-03-09 17:00:00");
        assert_eq!(format_pacific(Some(&at_end)), "2024-11-02 16:00:00");
    }

    #[test]
    fn feature_accessors_tolerate_missing_and_null() {
        let feature: RawFeature = serde_json::from_value(json!({
            "attributes": {
                "mission": "CA-XYZ-0001",
                "OBJECTID": 42,
                "incident_name": null,
                "area_acres": 1520.5
            },
            "geometry": { "rings": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]] }
        }))
        .expect("decode feature");

        assert_eq!(feature.mission().as_deref(), Some("CA-XYZ-0001"));
        assert_eq!(feature.object_id(), Some(42));
        assert_eq!(feature.attribute_text(ATTR_INCIDENT_NAME), "");
        assert_eq!(feature.attribute_text(ATTR_SOURCE), "");
        assert_eq!(feature.attribute_text(ATTR_AREA_ACRES), "1520.5");
        assert_eq!(feature.rings().len(), 1);
    }

    #[test]
    fn only_string_missions_are_dedup_keys() {
        let numeric: RawFeature =
            serde_json::from_value(json!({ "attributes": { "mission": 1, "OBJECTID": 5 } }))
                .expect("decode feature");
        let flagged: RawFeature =
            serde_json::from_value(json!({ "attributes": { "mission": true, "OBJECTID": 6 } }))
                .expect("decode feature");
        let text: RawFeature =
            serde_json::from_value(json!({ "attributes": { "mission": "1", "OBJECTID": 7 } }))
                .expect("decode feature");

        assert_eq!(numeric.mission(), None);
        assert_eq!(flagged.mission(), None);
        assert_eq!(text.mission().as_deref(), Some("1"));
    }

    #[test]
    fn feature_without_geometry_has_no_rings() {
        let feature: RawFeature =
            serde_json::from_value(json!({ "attributes": { "mission": "M" }, "geometry": null }))
                .expect("decode feature");
        assert!(feature.rings().is_empty());
        assert_eq!(feature.object_id(), None);
    }
}
