//! Hierarchical state dump tree used for diagnostic snapshots.
//!
//! Components describe their internal state by adding string or JSON leaves
//! to a collector. Collectors form a tree of namespaces; a namespace's full
//! name is its path of segments joined by `NAMESPACE_DELIMITER`.

use std::sync::Arc;

use crate::utils::EntityError;

use parking_lot::Mutex;

use serde_json::{Map, Value};

/// Delimiter between namespace segments; must not appear in segment names.
pub const NAMESPACE_DELIMITER: &str = ".";

/// Collector of diagnostic key-value state within one namespace.
pub trait StateDumpCollector {
    /// Returns a collector for the child namespace `name`. Fails if the
    /// name contains `NAMESPACE_DELIMITER`.
    fn sub_state_collector(
        &self,
        name: &str,
    ) -> Result<Box<dyn StateDumpCollector>, EntityError>;

    /// Adds a plain string value under `key`.
    fn add_state(&self, key: &str, value: &str);

    /// Adds a JSON value under `key`. Fails if `json` is not valid JSON.
    fn add_state_json(&self, key: &str, json: &str) -> Result<(), EntityError>;
}

/// Older string-only dumping interface.
pub trait StateDumper {
    /// Returns a dumper for the child namespace `name`.
    fn sub_state_dumper(
        &self,
        name: &str,
    ) -> Result<Box<dyn StateDumper>, EntityError>;

    /// Adds the given key-value mapping.
    fn dump(&self, key: &str, value: &str);
}

/// In-memory state dump tree. Clones and sub-trees share the same root.
#[derive(Debug, Clone, Default)]
pub struct StateTree {
    root: Arc<Mutex<Map<String, Value>>>,

    /// Namespace segments from the root to this node.
    path: Vec<String>,
}

impl StateTree {
    /// Creates a new empty tree, returning its root namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Full dotted name of this namespace; empty for the root.
    pub fn namespace(&self) -> String {
        self.path.join(NAMESPACE_DELIMITER)
    }

    /// Returns the child namespace `name` of this one.
    pub fn sub_tree(&self, name: &str) -> Result<StateTree, EntityError> {
        if name.is_empty() || name.contains(NAMESPACE_DELIMITER) {
            return Err(EntityError::msg(format!(
                "invalid namespace segment '{}'",
                name
            )));
        }
        let mut path = self.path.clone();
        path.push(name.into());
        Ok(StateTree {
            root: self.root.clone(),
            path,
        })
    }

    /// Inserts `value` under `key` in this namespace. A namespace and a leaf
    /// sharing a name replace each other, with a warning.
    fn insert(&self, key: &str, value: Value) {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for (depth, seg) in self.path.iter().enumerate() {
            let child = node
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                pf_warn!(
                    "statedump";
                    "namespace '{}' replaces leaf {}",
                    self.path[..=depth].join(NAMESPACE_DELIMITER),
                    child
                );
                *child = Value::Object(Map::new());
            }
            let Some(map) = child.as_object_mut() else {
                return;
            };
            node = map;
        }

        if node.get(key).is_some_and(Value::is_object) && !value.is_object() {
            pf_warn!(
                "statedump";
                "leaf '{}' replaces namespace in '{}'",
                key,
                self.namespace()
            );
        }
        node.insert(key.into(), value);
    }

    /// Snapshot of this namespace as a nested JSON object.
    pub fn to_json(&self) -> Value {
        let root = self.root.lock();
        let mut node = &*root;
        for seg in &self.path {
            match node.get(seg) {
                Some(Value::Object(map)) => node = map,
                _ => return Value::Object(Map::new()),
            }
        }
        Value::Object(node.clone())
    }
}

impl StateDumpCollector for StateTree {
    fn sub_state_collector(
        &self,
        name: &str,
    ) -> Result<Box<dyn StateDumpCollector>, EntityError> {
        Ok(Box::new(self.sub_tree(name)?))
    }

    fn add_state(&self, key: &str, value: &str) {
        self.insert(key, Value::String(value.into()));
    }

    fn add_state_json(&self, key: &str, json: &str) -> Result<(), EntityError> {
        let value: Value = serde_json::from_str(json)?;
        self.insert(key, value);
        Ok(())
    }
}

impl StateDumper for StateTree {
    fn sub_state_dumper(
        &self,
        name: &str,
    ) -> Result<Box<dyn StateDumper>, EntityError> {
        Ok(Box::new(self.sub_tree(name)?))
    }

    fn dump(&self, key: &str, value: &str) {
        self.add_state(key, value);
    }
}
