//! Per-slice outcome rollups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::Period;

/// Category label used for blank or missing outcomes.
pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// `count` of facts for one `(partition_key, period, category)` group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub partition_key: String,
    pub period: Period,
    pub category: String,
    pub count: u64,
}

/// Trim surrounding whitespace; blank becomes [`UNKNOWN_CATEGORY`].
pub fn normalize_category(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => UNKNOWN_CATEGORY.to_string(),
    }
}

/// Count the slice's fact categories, one row per normalized category,
/// ordered by category.
pub fn aggregate_slice<'a, I>(partition_key: &str, period: Period, categories: I) -> Vec<AggregateRow>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for category in categories {
        *counts.entry(normalize_category(category)).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(category, count)| AggregateRow {
            partition_key: partition_key.to_string(),
            period,
            category,
            count,
        })
        .collect()
}
