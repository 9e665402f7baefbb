use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single sample of system metrics (CPU, memory, GPU, ...) collected by
/// the client and relayed for the System file-stream chunk (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRecord {
    pub items: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}
