//! GraphQL operation documents and the variable builders that feed them
//! (§6). The schema itself is assumed given; only the shapes the Sender
//! relies on are modeled here.

use serde_json::{json, Value};

use crate::record::{ConfigMap, RunRecord};

pub const UPSERT_BUCKET: &str = r#"
mutation UpsertBucket($input: UpsertBucketInput!) {
  upsertBucket(input: $input) {
    bucket { displayName project { name } entity { name } }
  }
}
"#;

pub fn upsert_bucket_variables(run: &RunRecord, config: &ConfigMap) -> Value {
    json!({
        "input": {
            "id": run.id,
            "entity": run.entity,
            "project": run.project,
            "groupName": run.group,
            "jobType": run.job_type,
            "host": run.host,
            "program": run.program,
            "commit": run.commit,
            "repo": run.repo,
            "tags": run.tags,
            "displayName": run.display_name,
            "notes": run.notes,
            "config": config.to_wire_format().to_string(),
        }
    })
}

pub const RUN_RESUME_STATUS: &str = r#"
query RunResumeStatus($entity: String!, $project: String!, $name: String!) {
  bucket(name: $name, entityName: $entity, projectName: $project) {
    historyLineCount
    eventsLineCount
    logLineCount
    historyTail
    config
    summaryMetrics
    tags
  }
}
"#;

pub fn run_resume_status_variables(entity: &str, project: &str, run_id: &str) -> Value {
    json!({ "entity": entity, "project": project, "name": run_id })
}

pub const CREATE_RUN_FILES: &str = r#"
mutation CreateRunFiles($entity: String!, $project: String!, $run: String!, $files: [CreateRunFilesFileInput!]!) {
  createRunFiles(input: { entityName: $entity, projectName: $project, runName: $run, files: $files }) {
    files { name uploadUrl uploadHeaders }
  }
}
"#;

pub fn create_run_files_variables(
    entity: &str,
    project: &str,
    run_id: &str,
    files: &[(String, String)],
) -> Value {
    json!({
        "entity": entity,
        "project": project,
        "run": run_id,
        "files": files.iter().map(|(name, category)| json!({ "name": name, "category": category })).collect::<Vec<_>>(),
    })
}

pub const LINK_ARTIFACT: &str = r#"
mutation LinkArtifact($artifactId: ID!, $portfolioName: String!) {
  linkArtifact(input: { artifactID: $artifactId, artifactPortfolioName: $portfolioName }) {
    versionIndex
  }
}
"#;

pub fn link_artifact_variables(artifact_id: &str, portfolio_name: &str) -> Value {
    json!({ "artifactId": artifact_id, "portfolioName": portfolio_name })
}

pub const CREATE_ARTIFACT: &str = r#"
mutation CreateArtifact($entity: String!, $project: String!, $run: String!, $type: String!, $name: String!) {
  createArtifact(input: { entityName: $entity, projectName: $project, runName: $run, artifactTypeName: $type, name: $name }) {
    artifact { id digest }
  }
}
"#;

pub fn create_artifact_variables(entity: &str, project: &str, run_id: &str, artifact_type: &str, name: &str) -> Value {
    json!({ "entity": entity, "project": project, "run": run_id, "type": artifact_type, "name": name })
}

pub const COMMIT_ARTIFACT: &str = r#"
mutation CommitArtifact($artifactId: ID!) {
  commitArtifact(input: { artifactID: $artifactId }) { artifact { id } }
}
"#;

pub fn commit_artifact_variables(artifact_id: &str) -> Value {
    json!({ "artifactId": artifact_id })
}

pub const DOWNLOAD_ARTIFACT: &str = r#"
query DownloadArtifact($artifactId: ID!) {
  artifact(id: $artifactId) {
    id
    files { edges { node { name directUrl } } }
  }
}
"#;

pub fn download_artifact_variables(artifact_id: &str) -> Value {
    json!({ "artifactId": artifact_id })
}

pub const NOTIFY_SCRIPTABLE_RUN_ALERT: &str = r#"
mutation NotifyScriptableRunAlert($entity: String!, $project: String!, $run: String!, $title: String!, $text: String!, $level: AlertSeverity!) {
  notifyScriptableRunAlert(input: { entityName: $entity, projectName: $project, runName: $run, title: $title, text: $text, severity: $level }) {
    success
  }
}
"#;

pub fn notify_scriptable_run_alert_variables(
    entity: &str,
    project: &str,
    run_id: &str,
    title: &str,
    text: &str,
    level: &str,
) -> Value {
    json!({
        "entity": entity,
        "project": project,
        "run": run_id,
        "title": title,
        "text": text,
        "level": level,
    })
}
