//! Node type registry using ArcSwap
//!
//! Readers load the current map without locking; writers serialize on a mutex,
//! clone the map, install the `(constructor, definition)` pair in the copy and
//! swap the whole pointer. A reader therefore sees either the old map or the new
//! one, never a half-registered entry.

use crate::error::RegistryError;
use crate::nodes::{NodeConstructor, NodeDefinition};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A resolved registry entry
#[derive(Clone)]
pub struct RegisteredNode {
    pub constructor: NodeConstructor,
    pub definition: Arc<NodeDefinition>,
}

impl std::fmt::Debug for RegisteredNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredNode")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Maps node type keys to constructors and definitions.
///
/// Construct one at process start and share it by `Arc` with the engine and
/// any plugin loader.
pub struct NodeRegistry {
    /// Key: node type, Value: constructor + definition
    entries: ArcSwap<HashMap<String, RegisteredNode>>,
    /// Serializes writers so concurrent registrations can't lose each other's updates
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Registry pre-populated with the built-in node types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::nodes::builtin::register_builtins(&registry);
        registry
    }

    /// Register a node type, failing with `DuplicateType` if the key is taken
    pub fn register(
        &self,
        node_type: &str,
        constructor: NodeConstructor,
        definition: NodeDefinition,
    ) -> Result<(), RegistryError> {
        self.install(node_type, constructor, definition, false)
    }

    /// Register a node type, replacing any existing entry for the key
    pub fn register_or_replace(
        &self,
        node_type: &str,
        constructor: NodeConstructor,
        definition: NodeDefinition,
    ) -> Result<(), RegistryError> {
        self.install(node_type, constructor, definition, true)
    }

    fn install(
        &self,
        node_type: &str,
        constructor: NodeConstructor,
        definition: NodeDefinition,
        replace: bool,
    ) -> Result<(), RegistryError> {
        let invalid = |message: String| RegistryError::InvalidDefinition {
            node_type: node_type.to_string(),
            message,
        };
        if definition.type_name != node_type {
            return Err(invalid(format!(
                "definition is named '{}'",
                definition.type_name
            )));
        }
        definition.check().map_err(invalid)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load();
        if !replace && current.contains_key(node_type) {
            return Err(RegistryError::DuplicateType(node_type.to_string()));
        }

        let mut next = HashMap::clone(&current);
        let replaced = next
            .insert(
                node_type.to_string(),
                RegisteredNode {
                    constructor,
                    definition: Arc::new(definition),
                },
            )
            .is_some();
        self.entries.store(Arc::new(next));

        if replaced {
            tracing::info!(node_type, "🔁 Replaced node type");
        } else {
            tracing::debug!(node_type, "➕ Registered node type");
        }
        Ok(())
    }

    /// Remove a node type; returns whether it was present
    pub fn unregister(&self, node_type: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load();
        if !current.contains_key(node_type) {
            return false;
        }
        let mut next = HashMap::clone(&current);
        next.remove(node_type);
        self.entries.store(Arc::new(next));
        tracing::info!(node_type, "🗑️ Unregistered node type");
        true
    }

    /// Look up a node type (lock-free read)
    pub fn resolve(&self, node_type: &str) -> Result<RegisteredNode, RegistryError> {
        self.entries
            .load()
            .get(node_type)
            .cloned()
            .ok_or_else(|| RegistryError::TypeNotFound(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.load().contains_key(node_type)
    }

    /// Snapshot of all definitions, sorted by type name
    pub fn list(&self) -> Vec<Arc<NodeDefinition>> {
        let mut definitions: Vec<_> = self
            .entries
            .load()
            .values()
            .map(|entry| Arc::clone(&entry.definition))
            .collect();
        definitions.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        definitions
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.load();
        let mut types: Vec<&String> = entries.keys().collect();
        types.sort();
        f.debug_struct("NodeRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::nodes::{constructor, Node, NodeContext};
    use crate::workflow::types::ValueMap;
    use async_trait::async_trait;
    use serde_json::json;

    struct Constant(i64);

    #[async_trait]
    impl Node for Constant {
        async fn execute(&self, _ctx: &NodeContext, _inputs: ValueMap) -> Result<ValueMap, NodeError> {
            Ok(ValueMap::from([("value".to_string(), json!(self.0))]))
        }
    }

    fn def(name: &str, description: &str) -> NodeDefinition {
        NodeDefinition::new(name).describe(description)
    }

    #[test]
    fn duplicate_registration_is_rejected_unless_replacing() {
        let registry = NodeRegistry::new();
        registry
            .register("const", constructor(|| Constant(1)), def("const", "one"))
            .unwrap();

        let err = registry
            .register("const", constructor(|| Constant(2)), def("const", "two"))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateType("const".into()));
        assert_eq!(registry.resolve("const").unwrap().definition.description, "one");

        registry
            .register_or_replace("const", constructor(|| Constant(2)), def("const", "two"))
            .unwrap();
        assert_eq!(registry.resolve("const").unwrap().definition.description, "two");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_type_is_not_found() {
        let registry = NodeRegistry::new();
        assert_eq!(
            registry.resolve("missing").unwrap_err(),
            RegistryError::TypeNotFound("missing".into())
        );
    }

    #[test]
    fn malformed_definitions_are_refused() {
        let registry = NodeRegistry::new();
        let err = registry
            .register("a", constructor(|| Constant(0)), def("b", ""))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn list_is_sorted_and_unregister_removes() {
        let registry = NodeRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register(name, constructor(|| Constant(0)), def(name, ""))
                .unwrap();
        }
        let names: Vec<String> = registry.list().iter().map(|d| d.type_name.clone()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);

        assert!(registry.unregister("mid"));
        assert!(!registry.unregister("mid"));
        assert!(!registry.contains("mid"));
    }

    #[test]
    fn concurrent_registration_and_resolution() {
        let registry = Arc::new(NodeRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let name = format!("type-{i}");
                    registry
                        .register(&name, constructor(move || Constant(i)), def(&name, "w"))
                        .unwrap();
                })
            })
            .collect();
        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    for definition in registry.list() {
                        let entry = registry.resolve(&definition.type_name).unwrap();
                        assert_eq!(entry.definition.type_name, definition.type_name);
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(registry.len(), 8);
    }
}
