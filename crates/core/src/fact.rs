//! Typed fact rows derived from raw stop-and-search records.
//!
//! The transform is pure: field extraction, type coercion and
//! null-normalization only. Blank strings become `None`; numeric strings
//! become numbers; an absent or boolean `outcome` becomes `""`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Period;
use crate::record::{ContentHash, RawRecord};

/// One deduplicated stop-and-search entity, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub content_hash: ContentHash,
    pub partition_key: String,
    pub period: Period,
    pub stop_datetime: Option<DateTime<Utc>>,
    pub search_type: Option<String>,
    pub involved_person: Option<bool>,
    pub gender: Option<String>,
    pub age_range: Option<String>,
    pub self_defined_ethnicity: Option<String>,
    pub officer_defined_ethnicity: Option<String>,
    pub legislation: Option<String>,
    pub object_of_search: Option<String>,
    pub outcome: String,
    pub outcome_linked_to_object_of_search: Option<bool>,
    pub outcome_object_id: Option<String>,
    pub outcome_object_name: Option<String>,
    pub removal_of_more_than_outer_clothing: Option<bool>,
    pub operation: Option<bool>,
    pub operation_name: Option<String>,
    pub location_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub street_id: Option<i64>,
    pub street_name: Option<String>,
}

impl FactRow {
    /// Map a raw record to a fact row for the given slice.
    pub fn from_raw(partition_key: &str, period: Period, raw: &RawRecord) -> Self {
        let rec = raw.value();
        let location = rec.get("location").filter(|v| v.is_object());
        let street = location.and_then(|l| l.get("street")).filter(|v| v.is_object());
        let outcome_object = rec.get("outcome_object").filter(|v| v.is_object());

        Self {
            content_hash: raw.content_hash(),
            partition_key: partition_key.to_string(),
            period,
            stop_datetime: rec.get("datetime").and_then(timestamp),
            search_type: rec.get("type").and_then(text),
            involved_person: rec.get("involved_person").and_then(flag),
            gender: rec.get("gender").and_then(text),
            age_range: rec.get("age_range").and_then(text),
            self_defined_ethnicity: rec.get("self_defined_ethnicity").and_then(text),
            officer_defined_ethnicity: rec.get("officer_defined_ethnicity").and_then(text),
            legislation: rec.get("legislation").and_then(text),
            object_of_search: rec.get("object_of_search").and_then(text),
            outcome: outcome(rec.get("outcome")),
            outcome_linked_to_object_of_search: rec
                .get("outcome_linked_to_object_of_search")
                .and_then(flag),
            outcome_object_id: outcome_object.and_then(|o| o.get("id")).and_then(text),
            outcome_object_name: outcome_object.and_then(|o| o.get("name")).and_then(text),
            removal_of_more_than_outer_clothing: rec
                .get("removal_of_more_than_outer_clothing")
                .or_else(|| rec.get("removal_more_than_outer_clothing"))
                .and_then(flag),
            operation: rec.get("operation").and_then(flag),
            operation_name: rec.get("operation_name").and_then(text),
            location_type: rec
                .get("location_type")
                .or_else(|| location.and_then(|l| l.get("location_type")))
                .and_then(text),
            latitude: location.and_then(|l| l.get("latitude")).and_then(number),
            longitude: location.and_then(|l| l.get("longitude")).and_then(number),
            street_id: street.and_then(|s| s.get("id")).and_then(integer),
            street_name: street.and_then(|s| s.get("name")).and_then(text),
        }
    }

    /// Copy the fields that may change between deliveries of the same
    /// logical record. Returns whether anything changed.
    pub fn apply_mutable(&mut self, newer: &FactRow) -> bool {
        let before = (
            self.outcome.clone(),
            self.street_name.clone(),
            self.latitude,
            self.longitude,
            self.officer_defined_ethnicity.clone(),
            self.self_defined_ethnicity.clone(),
        );

        self.outcome = newer.outcome.clone();
        self.street_name = newer.street_name.clone();
        self.latitude = newer.latitude;
        self.longitude = newer.longitude;
        self.officer_defined_ethnicity = newer.officer_defined_ethnicity.clone();
        self.self_defined_ethnicity = newer.self_defined_ethnicity.clone();

        before
            != (
                self.outcome.clone(),
                self.street_name.clone(),
                self.latitude,
                self.longitude,
                self.officer_defined_ethnicity.clone(),
                self.self_defined_ethnicity.clone(),
            )
    }
}

/// Transform a batch of raw records for one slice.
pub fn to_facts(partition_key: &str, period: Period, raw: &[RawRecord]) -> Vec<FactRow> {
    raw.iter()
        .map(|r| FactRow::from_raw(partition_key, period, r))
        .collect()
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?.trim();
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn outcome(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn period() -> Period {
        "2024-05".parse().unwrap()
    }

    fn sample() -> RawRecord {
        RawRecord::new(json!({
            "datetime": "2024-05-01T14:23:00+00:00",
            "involved_person": true,
            "gender": "Male",
            "age_range": "18-24",
            "self_defined_ethnicity": "White",
            "officer_defined_ethnicity": "White",
            "legislation": "PACE s1",
            "object_of_search": "Controlled drugs",
            "outcome": "Arrest",
            "outcome_linked_to_object_of_search": true,
            "outcome_object": {"id": "drug-possession", "name": "Possession of drugs"},
            "removal_of_more_than_outer_clothing": false,
            "location": {
                "latitude": "51.5074",
                "longitude": "-0.1278",
                "street": {"id": 12345, "name": "Whitehall"}
            },
            "type": "Person search"
        }))
    }

    #[test]
    fn test_from_raw_happy_path() {
        let fact = FactRow::from_raw("metropolitan", period(), &sample());

        assert_eq!(fact.partition_key, "metropolitan");
        assert_eq!(fact.period.to_string(), "2024-05");
        assert_eq!(fact.outcome, "Arrest");
        assert_eq!(fact.object_of_search.as_deref(), Some("Controlled drugs"));
        assert_eq!(fact.street_name.as_deref(), Some("Whitehall"));
        assert_eq!(fact.street_id, Some(12345));
        assert_eq!(fact.latitude, Some(51.5074));
        assert_eq!(fact.longitude, Some(-0.1278));
        assert_eq!(fact.involved_person, Some(true));
        assert_eq!(fact.removal_of_more_than_outer_clothing, Some(false));
        assert_eq!(fact.outcome_object_id.as_deref(), Some("drug-possession"));
        assert_eq!(fact.search_type.as_deref(), Some("Person search"));
        assert_eq!(
            fact.stop_datetime.unwrap().to_rfc3339(),
            "2024-05-01T14:23:00+00:00"
        );
        assert_eq!(fact.content_hash, sample().content_hash());
    }

    #[test]
    fn test_outcome_false_or_missing_is_empty() {
        let fact = FactRow::from_raw("x", period(), &RawRecord::new(json!({"outcome": false})));
        assert_eq!(fact.outcome, "");

        let fact = FactRow::from_raw("x", period(), &RawRecord::new(json!({"outcome": null})));
        assert_eq!(fact.outcome, "");

        let fact = FactRow::from_raw("x", period(), &RawRecord::new(json!({})));
        assert_eq!(fact.outcome, "");
    }

    #[test]
    fn test_null_location_and_blank_strings() {
        let raw = RawRecord::new(json!({"location": null, "gender": "  ", "datetime": "not a date"}));
        let fact = FactRow::from_raw("x", period(), &raw);
        assert_eq!(fact.latitude, None);
        assert_eq!(fact.street_name, None);
        assert_eq!(fact.gender, None);
        assert_eq!(fact.stop_datetime, None);
    }

    #[test]
    fn test_zulu_timestamp() {
        let raw = RawRecord::new(json!({"datetime": "2024-05-10T12:00:00Z"}));
        let fact = FactRow::from_raw("x", period(), &raw);
        assert!(fact.stop_datetime.is_some());
    }

    #[test]
    fn test_apply_mutable_only_touches_mutable_fields() {
        let mut stored = FactRow::from_raw("metropolitan", period(), &sample());
        let mut newer = stored.clone();
        newer.outcome = "Community resolution".into();
        newer.street_name = Some("Parliament St".into());
        newer.gender = Some("Female".into());

        assert!(stored.apply_mutable(&newer));
        assert_eq!(stored.outcome, "Community resolution");
        assert_eq!(stored.street_name.as_deref(), Some("Parliament St"));
        assert_eq!(stored.gender.as_deref(), Some("Male"));

        assert!(!stored.apply_mutable(&newer));
    }
}
