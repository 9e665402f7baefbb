use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::config_map::ConfigMap;

/// The fields the client declares when starting a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub entity: String,
    pub project: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub resume: super::ResumeMode,
}

/// Mutable per-run record. Created on the first `Run` record, mutated only
/// by the Sender during the initial upsert and resume, never thereafter
/// (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    pub entity: String,
    pub project: String,
    pub display_name: String,
    pub tags: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub starting_step: u64,
    pub resumed: bool,
    pub runtime: f64,
}

impl RunState {
    pub fn from_run_record(run: &RunRecord) -> Self {
        Self {
            id: run.id.clone(),
            entity: run.entity.clone(),
            project: run.project.clone(),
            display_name: run
                .display_name
                .clone()
                .unwrap_or_else(|| run.id.clone()),
            tags: run.tags.clone(),
            start_time: run.start_time,
            starting_step: 0,
            resumed: false,
            runtime: 0.0,
        }
    }

    /// Merge the canonical identity returned by `UpsertBucket` (§4.10,
    /// invariant 3 in §8): the server's display_name/project/entity always
    /// win.
    pub fn merge_canonical(&mut self, display_name: &str, project: &str, entity: &str) {
        self.display_name = display_name.to_string();
        self.project = project.to_string();
        self.entity = entity.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_merge_overwrites_local_identity() {
        let run = RunRecord {
            id: "r1".into(),
            entity: "e".into(),
            project: "p".into(),
            display_name: None,
            group: None,
            job_type: None,
            host: None,
            program: None,
            commit: None,
            repo: None,
            tags: vec![],
            notes: None,
            config: ConfigMap::default(),
            start_time: Utc::now(),
            resume: super::super::ResumeMode::Allow,
        };
        let mut state = RunState::from_run_record(&run);
        state.merge_canonical("canonical-name", "canon-proj", "canon-ent");
        assert_eq!(state.display_name, "canonical-name");
        assert_eq!(state.project, "canon-proj");
        assert_eq!(state.entity, "canon-ent");
    }
}
