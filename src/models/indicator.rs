use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorScope {
    PerSymbol,
    Global,
}

/// A parameterised indicator definition, registered once at session start
/// and immutable for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorVariant {
    pub variant_id: String,
    pub base_type: String,
    /// Window sizes (seconds), thresholds, etc. Stored as a `BTreeMap` so
    /// canonicalisation (sorted keys, stable formatting) is free.
    pub parameters: BTreeMap<String, f64>,
    pub scope: IndicatorScope,
}

impl IndicatorVariant {
    /// Deduplication key: `(base_type, canonical-parameter-JSON)`. Two
    /// registrations with identical parameters collapse to one computation
    /// lane — the `BTreeMap` ordering makes the JSON serialisation stable.
    pub fn dedup_key(&self) -> String {
        let params_json =
            serde_json::to_string(&self.parameters).unwrap_or_else(|_| "{}".to_string());
        format!("{}:{}", self.base_type, params_json)
    }

    pub fn window_seconds(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).copied().unwrap_or(default)
    }

    /// The largest window this variant needs buffered, used to size the
    /// ring buffer for its lane. Every base type in the registry declares
    /// its windows using keys ending in `_seconds`; we take the max of those.
    pub fn max_window_seconds(&self) -> f64 {
        self.parameters
            .iter()
            .filter(|(k, _)| k.ends_with("_seconds"))
            .map(|(_, v)| *v)
            .fold(0.0, f64::max)
            .max(1.0)
    }
}

/// A computed indicator value, produced incrementally by the engine and
/// deduplicated at the sink by `(session_id, symbol, variant_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub session_id: String,
    pub symbol: String,
    pub variant_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_regardless_of_insertion_order() {
        let mut params_a = BTreeMap::new();
        params_a.insert("window_seconds".to_string(), 60.0);
        params_a.insert("threshold".to_string(), 3.0);

        let mut params_b = BTreeMap::new();
        params_b.insert("threshold".to_string(), 3.0);
        params_b.insert("window_seconds".to_string(), 60.0);

        let a = IndicatorVariant {
            variant_id: "a".to_string(),
            base_type: "TWPA".to_string(),
            parameters: params_a,
            scope: IndicatorScope::PerSymbol,
        };
        let b = IndicatorVariant {
            variant_id: "b".to_string(),
            base_type: "TWPA".to_string(),
            parameters: params_b,
            scope: IndicatorScope::PerSymbol,
        };

        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
