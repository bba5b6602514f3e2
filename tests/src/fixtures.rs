//! Upstream records and job messages shaped like the police API's.

use serde_json::{json, Value};

use ingest_core::Period;

pub const FORCE: &str = "metropolitan";
pub const MONTH: &str = "2024-05";

pub fn period() -> Period {
    Period::new(2024, 5).unwrap()
}

pub fn job_body(force: &str, month: &str) -> Value {
    json!({ "force": force, "month": month })
}

/// One stop-and-search record as returned by `/stops-force`.
pub fn stop(outcome: &str, latitude: &str, street_id: i64) -> Value {
    json!({
        "age_range": "18-24",
        "outcome": outcome,
        "involved_person": true,
        "self_defined_ethnicity": "White - English/Welsh/Scottish/Northern Irish/British",
        "gender": "Male",
        "legislation": "Misuse of Drugs Act 1971 (section 23)",
        "outcome_linked_to_object_of_search": null,
        "datetime": "2024-05-03T14:20:00+00:00",
        "removal_of_more_than_outer_clothing": false,
        "outcome_object": {"id": "bu-no-further-action", "name": "A no further action disposal"},
        "location": {
            "latitude": latitude,
            "street": {"id": street_id, "name": "On or near Shopping Area"},
            "longitude": "-0.125000"
        },
        "operation": false,
        "officer_defined_ethnicity": "White",
        "type": "Person search",
        "operation_name": null,
        "object_of_search": "Controlled drugs"
    })
}

/// The two-record month used by the end-to-end scenario.
pub fn two_stops() -> Value {
    json!([
        stop("Nothing found", "51.512000", 1_001),
        stop("Arrest", "51.513000", 1_002),
    ])
}
