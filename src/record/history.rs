use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A fully-resolved step of metrics, ready to append to the history
/// File-Stream chunk (§3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub items: Map<String, Value>,
}

/// A client-submitted step that has not yet been assigned `_step`/`_runtime`
/// (§4.8). The Handler synthesizes both before re-emitting as a
/// [`HistoryRecord`]. `step` is accepted on the wire for forward
/// compatibility but carries no weight in `_step` assignment: the server's
/// counter is the only source of truth (§4.8, Testable Property 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialHistoryRecord {
    pub items: Map<String, Value>,
    pub step: Option<u64>,
}

impl PartialHistoryRecord {
    /// Resolve into a full history step given the run's next step counter
    /// and start time. `_step` is always `next_step`, regardless of
    /// `self.step`, so it is strictly monotonically increasing no matter
    /// what a client sends; `_runtime` is derived from `_timestamp` when
    /// present (§4.8).
    pub fn into_history(self, next_step: u64, run_start: f64) -> HistoryRecord {
        let mut items = self.items;
        items.insert("_step".to_string(), Value::from(next_step));
        if let Some(timestamp) = items.get("_timestamp").and_then(Value::as_f64) {
            items.insert("_runtime".to_string(), Value::from(timestamp - run_start));
        }
        HistoryRecord { items }
    }
}
