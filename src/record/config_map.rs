use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Private key reserved for the Sender's own bookkeeping (telemetry +
/// metric definitions). The Handler never writes under this key directly.
pub const RESERVED_KEY: &str = "_wandb";

/// Ordered mapping key → nested JSON value (§3). Backed directly by
/// `serde_json::Map`, which preserves insertion order with the
/// `preserve_order` feature enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigMap(pub Map<String, Value>);

/// One update to apply to a `ConfigMap`: either an upsert at `path` or a
/// removal of the subtree rooted at `path`. `path` is a sequence of already
/// -split key segments (§4, supplementary data-model note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: Vec<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub updates: Vec<ChangeRecord>,
    pub removes: Vec<Vec<String>>,
}

impl ConfigMap {
    pub fn apply(&mut self, changes: &ChangeSet) {
        for update in &changes.updates {
            self.set_path(&update.path, update.value.clone());
        }
        for path in &changes.removes {
            self.remove_path(path);
        }
    }

    /// Set a value at a nested path, creating intermediate objects on
    /// demand (§4 supplementary note).
    pub fn set_path(&mut self, path: &[String], value: Value) {
        if path.is_empty() {
            return;
        }
        let mut cursor = &mut self.0;
        for segment in &path[..path.len() - 1] {
            let entry = cursor
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            cursor = entry.as_object_mut().expect("just coerced to object");
        }
        cursor.insert(path[path.len() - 1].clone(), value);
    }

    /// Remove the subtree at `path`. Per the open question in §9, this is a
    /// flat delete at the final segment only — ancestor objects left empty
    /// by the removal are not pruned, matching the source's observed
    /// behavior.
    pub fn remove_path(&mut self, path: &[String]) {
        if path.is_empty() {
            return;
        }
        let mut cursor = &mut self.0;
        for segment in &path[..path.len() - 1] {
            match cursor.get_mut(segment).and_then(Value::as_object_mut) {
                Some(next) => cursor = next,
                None => return,
            }
        }
        cursor.remove(&path[path.len() - 1]);
    }

    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let mut cursor = &self.0;
        let (last, rest) = path.split_last()?;
        for segment in rest {
            cursor = cursor.get(segment)?.as_object()?;
        }
        cursor.get(last)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Format as `{"value": ...}` per key for the `UpsertBucket` wire
    /// format (§4.10 sendConfig).
    pub fn to_wire_format(&self) -> Value {
        let mut wrapped = Map::new();
        for (key, value) in &self.0 {
            let mut entry = Map::new();
            entry.insert("value".to_string(), value.clone());
            wrapped.insert(key.clone(), Value::Object(entry));
        }
        Value::Object(wrapped)
    }

    /// Render the top-level `{value: ...}`-wrapped form used for
    /// `config.yaml` (§6).
    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.to_wire_format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_set_creates_intermediate_objects() {
        let mut cfg = ConfigMap::default();
        cfg.set_path(&["a".into(), "b".into(), "c".into()], json!(1));
        assert_eq!(
            cfg.get_path(&["a".into(), "b".into(), "c".into()]),
            Some(&json!(1))
        );
    }

    #[test]
    fn remove_leaves_empty_ancestor_in_place() {
        let mut cfg = ConfigMap::default();
        cfg.set_path(&["a".into(), "b".into()], json!(1));
        cfg.remove_path(&["a".into(), "b".into()]);
        assert_eq!(cfg.get_path(&["a".into(), "b".into()]), None);
        // The now-empty "a" object is left in place, not pruned.
        assert!(cfg.0.get("a").unwrap().is_object());
    }

    #[test]
    fn round_trip_through_json_is_stable() {
        let mut cfg = ConfigMap::default();
        cfg.set_path(&["lr".into()], json!(0.01));
        cfg.set_path(&["nested".into(), "x".into()], json!("y"));
        let serialized = serde_json::to_string(&cfg).unwrap();
        let reparsed: ConfigMap = serde_json::from_str(&serialized).unwrap();
        let reserialized = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(serialized, reserialized);
    }

    #[test]
    fn wire_format_wraps_each_top_level_key() {
        let mut cfg = ConfigMap::default();
        cfg.set_path(&["epochs".into()], json!(5));
        let wire = cfg.to_wire_format();
        assert_eq!(wire["epochs"]["value"], json!(5));
    }
}
