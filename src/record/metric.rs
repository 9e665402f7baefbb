use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single metric definition declared by the client (§3). Identified by
/// unique `name`; `step_metric_index` is a 1-based back-reference into the
/// list it was inserted into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(default)]
    pub step_metric: Option<String>,
    #[serde(default)]
    pub step_metric_index: Option<u32>,
    #[serde(default)]
    pub glob_name: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub options: Value,
}

/// Ordered list of metric definitions, owned exclusively by the Handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricDefinitions(pub Vec<MetricDefinition>);

impl MetricDefinitions {
    /// Append a definition, assigning `step_metric_index` at insert time by
    /// resolving `step_metric` against already-declared metrics (§4.8).
    /// Glob definitions are rejected by the caller before this is reached
    /// (§4.10 sendMetric) — a hook for that is `reject_globs`.
    pub fn append(&mut self, mut def: MetricDefinition) -> usize {
        if let Some(step_metric) = &def.step_metric {
            def.step_metric_index = self
                .0
                .iter()
                .position(|m| &m.name == step_metric)
                .map(|idx| (idx + 1) as u32);
        }
        self.0.push(def);
        self.0.len() - 1
    }

    pub fn find_by_name(&self, name: &str) -> Option<&MetricDefinition> {
        self.0.iter().find(|m| m.name == name)
    }

    /// `_wandb.m` wire representation used when round-tripping metric
    /// definitions through `ConfigMap` (§4.10 sendMetric).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Array(vec![]))
    }
}
