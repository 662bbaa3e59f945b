// ========================================================================================
//                          Per-kit results of a scoring round
// ========================================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Everything known about one definition after a scoring round. Numeric fields are
/// absent rather than NaN when they could not be computed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
    pub trait_label: String,
    pub retention_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DefinitionResult {
    pub fn failed(trait_label: String, error: impl ToString) -> Self {
        Self {
            trait_label,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KitResults {
    pub round_id: String,
    /// Keyed by canonical definition ID. A second file for an already-claimed ID is
    /// reported under its own path.
    pub definitions: BTreeMap<String, DefinitionResult>,
}

/// Kit ID to the results of its most recent scoring round.
#[derive(Debug, Default)]
pub struct ResultsCache {
    inner: RwLock<HashMap<String, KitResults>>,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `results`, replacing any earlier round for the same kit.
    pub fn insert(&self, kit_id: &str, results: KitResults) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(kit_id.to_string(), results);
    }

    pub fn get(&self, kit_id: &str) -> Option<KitResults> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(kit_id).cloned()
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn round(id: &str, mean: f64) -> KitResults {
        let mut definitions = BTreeMap::new();
        definitions.insert(
            "PGS000001".to_string(),
            DefinitionResult {
                user_mean: Some(mean),
                trait_label: "Height".to_string(),
                ..Default::default()
            },
        );
        KitResults {
            round_id: id.to_string(),
            definitions,
        }
    }

    #[test]
    fn rescoring_overwrites_previous_round() {
        let cache = ResultsCache::new();
        cache.insert("kit-1", round("r1", 0.1));
        cache.insert("kit-1", round("r2", 0.2));
        let stored = cache.get("kit-1").unwrap();
        assert_eq!(stored.round_id, "r2");
        assert_eq!(stored.definitions["PGS000001"].user_mean, Some(0.2));
        assert!(cache.get("kit-2").is_none());

        cache.clear();
        assert!(cache.get("kit-1").is_none());
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(ResultsCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    cache.insert(&format!("kit-{}", i % 2), round(&format!("r{i}"), i as f64));
                    cache.get("kit-0")
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.get("kit-0").is_some());
        assert!(cache.get("kit-1").is_some());
    }

    #[test]
    fn absent_values_are_omitted_from_json() {
        let result = DefinitionResult::failed("Height".to_string(), "plink2 exited with 1");
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("z_score").is_none());
        assert_eq!(json["error"], "plink2 exited with 1");
        assert_eq!(json["retention_percent"], 0.0);
    }
}
