use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Last-writer-wins mapping key → scalar/JSON value, reset whenever a full
/// `Summary` record arrives (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryMap(pub Map<String, Value>);

impl SummaryMap {
    pub fn reset(&mut self) {
        self.0.clear();
    }

    pub fn update(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn apply_updates(&mut self, updates: impl IntoIterator<Item = (String, Value)>) {
        for (key, value) in updates {
            self.update(key, value);
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_write_wins() {
        let mut summary = SummaryMap::default();
        summary.update("loss", json!(0.9));
        summary.update("loss", json!(0.1));
        assert_eq!(summary.0.get("loss"), Some(&json!(0.1)));
    }

    #[test]
    fn full_summary_resets_previous_keys() {
        let mut summary = SummaryMap::default();
        summary.update("loss", json!(0.1));
        summary.reset();
        assert!(summary.0.is_empty());
    }
}
