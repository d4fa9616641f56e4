//! Name → position mapping for metric samples.
//!
//! A metrics row is positional: `[cpu, [eth0, eth1], memory]`.  Grid rows name
//! what they want with a path such as `["network.bytes", "eth1"]`.  The mapping
//! translates each path component into an index, one level per component:
//!
//! ```text
//! "cpu.basic.user"  -> index 0
//! "network.bytes"   -> index 1, children { "eth0" -> 0, "eth1" -> 1 }
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

/// One level of the mapping tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    nodes: BTreeMap<String, MappingNode>,
}

/// Position of a named element plus the mapping for its children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingNode {
    pub index: usize,
    pub children: Mapping,
}

impl MappingNode {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            children: Mapping::default(),
        }
    }
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: MappingNode) {
        self.nodes.insert(name.into(), node);
    }

    pub fn get(&self, name: &str) -> Option<&MappingNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Builds a mapping from its JSON form, where each node is an object with
    /// its own index under the empty key:
    ///
    /// ```text
    /// { "one": { "": 0, "sub": { "": 0 } }, "two": { "": 1 } }
    /// ```
    ///
    /// Entries without a numeric `""` key are skipped.
    pub fn from_value(value: &Value) -> Self {
        let mut mapping = Mapping::new();
        if let Some(object) = value.as_object() {
            for (name, node) in object {
                if name.is_empty() {
                    continue;
                }
                let Some(index) = node.get("").and_then(Value::as_u64) else {
                    continue;
                };
                mapping.insert(
                    name.clone(),
                    MappingNode {
                        index: index as usize,
                        children: Mapping::from_value(node),
                    },
                );
            }
        }
        mapping
    }
}

/// Walks `path` through `sample`, using `mapping` where it has an entry for
/// the component and plain key/index lookup where it does not.
///
/// JSON "falsy" intermediates (`null`, `false`, `0`, `""`) end the walk with no
/// value, as do missing keys.
pub fn resolve<'a>(sample: Option<&'a Value>, mapping: Option<&Mapping>, path: &[String]) -> Option<&'a Value> {
    let mut data = sample;
    let mut map = mapping;

    for component in path {
        let current = data?;
        if is_falsy(current) {
            return None;
        }

        match map.and_then(|m| m.get(component)) {
            Some(node) => {
                data = index(current, node.index);
                map = Some(&node.children);
            }
            None => {
                map = None;
                data = lookup(current, component);
            }
        }
    }

    data
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn index(value: &Value, idx: usize) -> Option<&Value> {
    match value {
        Value::Array(items) => items.get(idx),
        Value::Object(map) => map.get(&idx.to_string()),
        _ => None,
    }
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_value_builds_nested_nodes() {
        let mapping = Mapping::from_value(&json!({
            "one": { "": 0, "sub": { "": 0 }, "other": { "": 1 } },
            "two": { "": 1 }
        }));

        assert_eq!(mapping.len(), 2);
        let one = mapping.get("one").unwrap();
        assert_eq!(one.index, 0);
        assert_eq!(one.children.get("other").unwrap().index, 1);
    }

    #[test]
    fn test_resolve_through_mapping() {
        // Arrange
        let mapping = Mapping::from_value(&json!({
            "one": { "": 0, "sub": { "": 0 }, "other": { "": 1 } },
            "two": { "": 1, "sub": { "": 0 }, "other": { "": 1 } }
        }));
        let sample = json!([[1, 2], [3, 4]]);

        // Act
        let value = resolve(Some(&sample), Some(&mapping), &path(&["two", "other"]));

        // Assert
        assert_eq!(value, Some(&json!(4)));
    }

    #[test]
    fn test_resolve_without_mapping_uses_keys() {
        let sample = json!({"one": {"sub": 7}});
        assert_eq!(resolve(Some(&sample), None, &path(&["one", "sub"])), Some(&json!(7)));
    }

    #[test]
    fn test_empty_path_returns_sample() {
        let sample = json!(12);
        assert_eq!(resolve(Some(&sample), None, &[]), Some(&json!(12)));
    }

    #[test]
    fn test_falsy_intermediate_yields_nothing() {
        let sample = json!({"one": 0});
        assert_eq!(resolve(Some(&sample), None, &path(&["one", "sub"])), None);
    }
}
