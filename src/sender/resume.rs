//! Interprets a `RunResumeStatus` GraphQL payload into a [`ResumeState`]
//! seed, or rejects an invalid mode/existence combination (§4.12).

use serde_json::Value;

use crate::error::{RuncoreError, RuncoreResult};
use crate::record::{ConfigMap, ResumeMode, ResumeState, SummaryMap};

/// The backend's answer to "does this run already have history". `None`
/// when the bucket does not exist at all.
pub struct RunResumeStatus {
    pub exists: bool,
    pub history_line_count: u64,
    pub events_line_count: i64,
    pub log_line_count: i64,
    /// Raw JSON-encoded history tail lines, newest last.
    pub history_tail: Vec<String>,
    pub summary_metrics: Option<String>,
    pub config: Option<String>,
    pub tags: Vec<String>,
}

/// Reconcile `mode` against `status`, producing a seed for the Handler and
/// File-Stream, or a descriptive error if the mode and the run's existence
/// are incompatible (§4.12).
pub fn reconcile(
    mode: ResumeMode,
    project: &str,
    run_id: &str,
    status: &RunResumeStatus,
) -> RuncoreResult<ResumeState> {
    if status.exists && mode == ResumeMode::Never {
        return Err(RuncoreError::Resume {
            message: format!(
                "not a valid option for resuming a run ({project}/{run_id}) that already exists"
            ),
        });
    }
    if !status.exists && mode == ResumeMode::Must {
        return Err(RuncoreError::Resume {
            message: format!(
                "not a valid option for resuming a run ({project}/{run_id}) that does not exist"
            ),
        });
    }

    if !status.exists {
        return Ok(ResumeState::default());
    }

    let tail: Vec<Value> = status
        .history_tail
        .iter()
        .map(|line| {
            serde_json::from_str(line).map_err(|e| RuncoreError::Resume {
                message: format!("failed to unmarshal history tail: {e}"),
            })
        })
        .collect::<RuncoreResult<_>>()?;

    let last_seen_step = match tail.last() {
        Some(entry) => Some(
            entry
                .as_object()
                .ok_or_else(|| RuncoreError::Resume {
                    message: "failed to unmarshal history tail map".to_string(),
                })?
                .get("_step")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        ),
        None => None,
    };

    // Open Questions resolution: empty tail -> 0; otherwise the larger of
    // the reported count and one past the last observed step, since the
    // two can disagree when the backend's count lags the tail.
    let starting_step = match last_seen_step {
        None => 0,
        Some(last_step) => status.history_line_count.max(last_step + 1),
    };

    let runtime = tail
        .first()
        .and_then(|entry| entry.get("_runtime"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let summary_seed = match &status.summary_metrics {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).map_err(|e| RuncoreError::Resume {
                message: format!("failed to unmarshal summary metrics: {e}"),
            })?;
            let mut summary = SummaryMap::default();
            if let Some(obj) = value.as_object() {
                summary.apply_updates(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            summary
        }
        None => SummaryMap::default(),
    };

    let config_seed = match &status.config {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).map_err(|e| RuncoreError::Resume {
                message: format!("failed to unmarshal config: {e}"),
            })?;
            let mut config = ConfigMap::default();
            if let Some(obj) = value.as_object() {
                for (key, entry) in obj {
                    // Malformed individual items are skipped non-fatally
                    // rather than failing the whole resume (§4.12).
                    if let Some(inner) = entry.get("value") {
                        config.set_path(&[key.clone()], inner.clone());
                    }
                }
            }
            config
        }
        None => ConfigMap::default(),
    };

    let mut file_stream_offsets = crate::record::FileStreamOffsets::new();
    file_stream_offsets.insert(
        crate::record::FileStreamChunkType::History,
        status.history_line_count as i64,
    );
    file_stream_offsets.insert(crate::record::FileStreamChunkType::System, status.events_line_count);
    file_stream_offsets.insert(crate::record::FileStreamChunkType::ConsoleOut, status.log_line_count);

    Ok(ResumeState {
        mode,
        file_stream_offsets,
        starting_step,
        runtime,
        summary_seed,
        config_seed,
        tags_seed: status.tags.clone(),
        resumed_flag: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(history_line_count: u64, tail: Vec<&str>) -> RunResumeStatus {
        RunResumeStatus {
            exists: true,
            history_line_count,
            events_line_count: 0,
            log_line_count: 0,
            history_tail: tail.into_iter().map(str::to_string).collect(),
            summary_metrics: None,
            config: None,
            tags: vec![],
        }
    }

    #[test]
    fn must_on_missing_run_is_rejected() {
        let status = RunResumeStatus {
            exists: false,
            history_line_count: 0,
            events_line_count: 0,
            log_line_count: 0,
            history_tail: vec![],
            summary_metrics: None,
            config: None,
            tags: vec![],
        };
        let err = reconcile(ResumeMode::Must, "p", "missing", &status).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn never_on_existing_run_is_rejected() {
        let status = status(3, vec![]);
        let err = reconcile(ResumeMode::Never, "p", "r1", &status).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn empty_tail_starts_at_zero() {
        let status = status(0, vec![]);
        let resume = reconcile(ResumeMode::Allow, "p", "r1", &status).unwrap();
        assert_eq!(resume.starting_step, 0);
        assert!(resume.resumed_flag);
    }

    #[test]
    fn tail_with_step_resumes_past_last_seen_step() {
        let status = status(3, vec![r#"{"_step":1,"_runtime":50}"#]);
        let resume = reconcile(ResumeMode::Allow, "p", "r1", &status).unwrap();
        assert_eq!(resume.starting_step, 3);
        assert_eq!(resume.runtime, 50.0);
    }

    #[test]
    fn malformed_tail_entry_is_a_descriptive_error() {
        let status = status(1, vec!["not json"]);
        let err = reconcile(ResumeMode::Allow, "p", "r1", &status).unwrap_err();
        assert!(err.to_string().contains("failed to unmarshal history tail"));
    }
}
