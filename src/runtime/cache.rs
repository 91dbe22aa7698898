//! Output memoisation for cacheable node types
//!
//! Keyed by node type plus the canonical JSON of its config and inputs. Both
//! maps are ordered, so equal values always produce equal keys.

use crate::workflow::types::ValueMap;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Cache key for one node invocation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub node_type: String,
    pub config: String,
    pub inputs: String,
}

impl CacheKey {
    pub fn new(node_type: &str, config: &ValueMap, inputs: &ValueMap) -> Self {
        Self {
            node_type: node_type.to_string(),
            config: canonical(config),
            inputs: canonical(inputs),
        }
    }
}

fn canonical(map: &ValueMap) -> String {
    // A BTreeMap of serde_json values always serializes
    serde_json::to_string(map).unwrap_or_default()
}

/// Outputs shared by every execution of one engine
#[derive(Debug, Default)]
pub struct OutputCache {
    entries: RwLock<HashMap<CacheKey, ValueMap>>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<ValueMap> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, outputs: ValueMap) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, outputs);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
