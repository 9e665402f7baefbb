//! Replays a transaction log through an injected send function, letting an
//! offline run be reconciled with the backend after the fact (§4.13).

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tracing::warn;

use crate::error::RuncoreResult;
use crate::record::{ExitRecord, Record, RecordKind};
use crate::txlog::TransactionLogReader;

pub type SendFn = Box<dyn Fn(Record) -> Pin<Box<dyn Future<Output = RuncoreResult<()>> + Send>> + Send>;

/// Entity/project/run_id overrides applied to every `Run` record replayed
/// from the log, plus whether `OutputRaw` records should be skipped
/// entirely (§4.13).
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub overwrite_entity: Option<String>,
    pub overwrite_project: Option<String>,
    pub overwrite_run_id: Option<String>,
    pub skip_output_raw: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    pub new_run_url: Option<String>,
    pub error: Option<String>,
}

/// Drives a [`TransactionLogReader`] to completion, applying `options` to
/// each record before handing it to `send`.
pub struct SyncService {
    options: SyncOptions,
    base_url: String,
}

impl SyncService {
    pub fn new(options: SyncOptions, base_url: impl Into<String>) -> Self {
        Self { options, base_url: base_url.into() }
    }

    /// Replay `log_path` to completion. A read error other than a clean EOF
    /// synthesizes a failure `Exit` record with code 1 so the backend still
    /// sees a terminated run, and is reported back in the response rather
    /// than propagated to the caller (§4.13).
    pub async fn run(&self, log_path: &Path, send: SendFn) -> RuncoreResult<SyncResponse> {
        let mut reader = TransactionLogReader::open(log_path).await?;
        let mut new_run_url = None;
        let mut error = None;

        loop {
            let next = reader.next_record().await;
            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "transaction log read failed, synthesizing a failure exit");
                    error = Some(e.to_string());
                    let exit = Record::new(RecordKind::Exit(ExitRecord { exit_code: 1 }));
                    if let Err(send_err) = send(exit).await {
                        warn!(error = %send_err, "failed to deliver synthesized failure exit");
                    }
                    break;
                }
            };

            let record = self.apply_overrides(record);
            if self.options.skip_output_raw && matches!(record.kind, RecordKind::OutputRaw(_)) {
                continue;
            }

            if let RecordKind::Run(run) = &record.kind {
                new_run_url = Some(format!(
                    "{}/{}/{}/runs/{}",
                    self.base_url.trim_end_matches('/'),
                    run.entity,
                    run.project,
                    run.id
                ));
            }

            if let Err(e) = send(record).await {
                warn!(error = %e, "sync service failed to forward a replayed record");
                error = Some(e.to_string());
                break;
            }
        }

        Ok(SyncResponse { new_run_url, error })
    }

    fn apply_overrides(&self, mut record: Record) -> Record {
        if let RecordKind::Run(run) = &mut record.kind {
            if let Some(entity) = &self.options.overwrite_entity {
                run.entity = entity.clone();
            }
            if let Some(project) = &self.options.overwrite_project {
                run.project = project.clone();
            }
            if let Some(run_id) = &self.options.overwrite_run_id {
                run.id = run_id.clone();
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RunRecord;
    use crate::txlog::TransactionLogWriter;
    use std::sync::{Arc, Mutex};

    fn run_record(entity: &str, project: &str, id: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            entity: entity.to_string(),
            project: project.to_string(),
            display_name: None,
            group: None,
            job_type: None,
            host: None,
            program: None,
            commit: None,
            repo: None,
            tags: vec![],
            notes: None,
            config: Default::default(),
            start_time: chrono::Utc::now(),
            resume: Default::default(),
        }
    }

    #[tokio::test]
    async fn replays_records_in_order_and_reports_the_new_run_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut writer = TransactionLogWriter::create(&path).await.unwrap();
        writer.append(&Record::new(RecordKind::Run(run_record("e", "p", "r1")))).await.unwrap();
        writer.append(&Record::new(RecordKind::Footer)).await.unwrap();
        writer.close().await.unwrap();

        let received: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        let send: SendFn = Box::new(move |record| {
            let captured = Arc::clone(&captured);
            Box::pin(async move {
                captured.lock().unwrap().push(record);
                Ok(())
            })
        });

        let service = SyncService::new(SyncOptions::default(), "https://api.wandb.ai");
        let response = service.run(&path, send).await.unwrap();

        assert_eq!(response.new_run_url.as_deref(), Some("https://api.wandb.ai/e/p/runs/r1"));
        assert!(response.error.is_none());
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overwrite_options_rewrite_the_run_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut writer = TransactionLogWriter::create(&path).await.unwrap();
        writer.append(&Record::new(RecordKind::Run(run_record("e", "p", "r1")))).await.unwrap();
        writer.close().await.unwrap();

        let options = SyncOptions {
            overwrite_entity: Some("new-entity".to_string()),
            overwrite_project: None,
            overwrite_run_id: Some("new-run".to_string()),
            skip_output_raw: false,
        };
        let received: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        let send: SendFn = Box::new(move |record| {
            let captured = Arc::clone(&captured);
            Box::pin(async move {
                captured.lock().unwrap().push(record);
                Ok(())
            })
        });

        let service = SyncService::new(options, "https://api.wandb.ai");
        let response = service.run(&path, send).await.unwrap();
        assert_eq!(response.new_run_url.as_deref(), Some("https://api.wandb.ai/new-entity/p/runs/new-run"));

        let forwarded = received.lock().unwrap();
        match &forwarded[0].kind {
            RecordKind::Run(run) => {
                assert_eq!(run.entity, "new-entity");
                assert_eq!(run.project, "p");
                assert_eq!(run.id, "new-run");
            }
            _ => panic!("expected a Run record"),
        }
    }

    #[tokio::test]
    async fn skip_output_raw_drops_those_records_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut writer = TransactionLogWriter::create(&path).await.unwrap();
        writer
            .append(&Record::new(RecordKind::OutputRaw(crate::record::OutputRawRecord {
                line: "hello\n".to_string(),
                stream: crate::record::OutputStream::Stdout,
                timestamp: chrono::Utc::now(),
            })))
            .await
            .unwrap();
        writer.close().await.unwrap();

        let options = SyncOptions { skip_output_raw: true, ..Default::default() };
        let received: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&received);
        let send: SendFn = Box::new(move |record| {
            let captured = Arc::clone(&captured);
            Box::pin(async move {
                captured.lock().unwrap().push(record);
                Ok(())
            })
        });

        let service = SyncService::new(options, "https://api.wandb.ai");
        service.run(&path, send).await.unwrap();
        assert!(received.lock().unwrap().is_empty());
    }
}
