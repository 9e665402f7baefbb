//! Applies every record to in-memory state before forwarding it onward to
//! the Writer (transaction log) and Sender (backend), exactly in that
//! order (§4.8).

pub mod debounce;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{RuncoreError, RuncoreResult};
use crate::record::{
    ChangeSet, ConfigMap, MetricDefinitions, Record, RecordKind, RequestKind, ResumeState, RunRecord,
    RunState, SummaryMap,
};
use crate::sender::HandlerControl;
use debounce::ConfigDebouncer;

/// Driven purely by the record stream (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Initial,
    Upserted,
    Running,
    Exiting,
    Finished,
}

/// Owns `RunState`, `ConfigMap`, `SummaryMap` and `MetricDefinitions`;
/// mutated only from this task (§5 shared-resource policy).
pub struct Handler {
    state: HandlerState,
    run: Option<RunState>,
    run_start_time: f64,
    next_step: u64,
    config: ConfigMap,
    summary: SummaryMap,
    metrics: MetricDefinitions,
    debouncer: ConfigDebouncer,
    writer_tx: mpsc::Sender<Record>,
    sender_tx: mpsc::Sender<Record>,
    completed_file_transfers: Vec<std::path::PathBuf>,
}

impl Handler {
    pub fn new(writer_tx: mpsc::Sender<Record>, sender_tx: mpsc::Sender<Record>) -> Self {
        Self::with_debounce(
            writer_tx,
            sender_tx,
            debounce::DEFAULT_RATE_PER_SEC,
            debounce::DEFAULT_BURST,
        )
    }

    /// Same as [`Handler::new`], but with the Config-upsert debouncer's
    /// rate/burst taken from the caller's configuration rather than the
    /// built-in default (§4.8, service assembly reads `ServiceConfig.
    /// debounce`).
    pub fn with_debounce(
        writer_tx: mpsc::Sender<Record>,
        sender_tx: mpsc::Sender<Record>,
        debounce_rate_per_sec: f64,
        debounce_burst: f64,
    ) -> Self {
        Self {
            state: HandlerState::Initial,
            run: None,
            run_start_time: 0.0,
            next_step: 0,
            config: ConfigMap::default(),
            summary: SummaryMap::default(),
            metrics: MetricDefinitions::default(),
            debouncer: ConfigDebouncer::new(debounce_rate_per_sec, debounce_burst),
            writer_tx,
            sender_tx,
            completed_file_transfers: Vec::new(),
        }
    }

    /// Seed state from a resolved resume (§4.12), before the first record
    /// is processed.
    pub fn seed_resume(&mut self, resume: &ResumeState) {
        self.next_step = resume.starting_step;
        self.run_start_time -= resume.runtime;
        self.summary = resume.summary_seed.clone();
        self.config.apply(&ChangeSet {
            updates: resume
                .config_seed
                .0
                .iter()
                .map(|(key, value)| crate::record::ChangeRecord {
                    path: vec![key.clone()],
                    value: value.clone(),
                })
                .collect(),
            removes: vec![],
        });
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn current_config(&self) -> &ConfigMap {
        &self.config
    }

    pub fn current_summary(&self) -> &SummaryMap {
        &self.summary
    }

    /// Files whose upload has completed, for UI accounting (§4.10
    /// sendFiles).
    pub fn completed_file_transfers(&self) -> &[std::path::PathBuf] {
        &self.completed_file_transfers
    }

    /// Apply `record` to local state, then route it to the Writer and
    /// (subject to debouncing) the Sender. This is the single entry point
    /// the connection's handler task calls for every inbound record
    /// (§4.8).
    pub async fn handle(&mut self, record: Record) -> RuncoreResult<()> {
        match &record.kind {
            RecordKind::Run(run) => self.apply_run(run),
            RecordKind::Summary(summary) => {
                self.summary.reset();
                self.summary.apply_updates(
                    summary
                        .0
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
            RecordKind::Config(changes) => self.config.apply(changes),
            RecordKind::Metric(def) => {
                if def.glob_name.is_some() {
                    warn!(name = %def.name, "glob metric definitions are rejected");
                    return Ok(());
                }
                self.metrics.append(def.clone());
                self.config.set_path(
                    &[crate::record::config_map::RESERVED_KEY.to_string(), "m".to_string()],
                    self.metrics.to_json(),
                );
            }
            RecordKind::Exit(_) => self.state = HandlerState::Exiting,
            RecordKind::Request(RequestKind::PartialHistory(partial)) => {
                let history = partial.clone().into_history(self.next_step, self.run_start_time);
                // `_step` in the synthesized record is always `self.next_step`;
                // any client-supplied `step` was ignored by `into_history`.
                self.next_step += 1;
                let synthesized = Record::with_control(RecordKind::History(history), record.control.clone());
                return self.route(synthesized).await;
            }
            _ => {}
        }

        if self.state == HandlerState::Upserted {
            self.state = HandlerState::Running;
        }

        self.route(record).await
    }

    fn apply_run(&mut self, run: &RunRecord) {
        self.run_start_time = run.start_time.timestamp() as f64;
        self.run = Some(RunState::from_run_record(run));
        self.state = HandlerState::Upserted;
    }

    /// Writer always receives every non-Request record in processing
    /// order; the Sender receives the same records plus selected
    /// Requests, with Config upserts debounced (§4.8).
    async fn route(&self, record: Record) -> RuncoreResult<()> {
        if record.kind.is_persistable() {
            self.writer_tx
                .send(record.clone())
                .await
                .map_err(|_| RuncoreError::ChannelClosed("writer".to_string()))?;
        }

        let forward_now = match &record.kind {
            RecordKind::Config(_) => self.debouncer.notify(),
            _ => true,
        };
        if forward_now {
            self.sender_tx
                .send(record)
                .await
                .map_err(|_| RuncoreError::ChannelClosed("sender".to_string()))?;
        }
        Ok(())
    }

    /// Called when the defer walk reaches `FLUSH_DEBOUNCER`: force out any
    /// coalesced Config change regardless of the limiter (§4.8, §4.10).
    pub async fn flush_debounced_config(&self) -> RuncoreResult<()> {
        if self.debouncer.take_dirty() {
            let record = Record::new(RecordKind::Config(ChangeSet::default()));
            self.sender_tx
                .send(record)
                .await
                .map_err(|_| RuncoreError::ChannelClosed("sender".to_string()))?;
        }
        Ok(())
    }

    pub fn mark_finished(&mut self) {
        self.state = HandlerState::Finished;
    }

    /// Drives the connection's record stream to completion, servicing
    /// `control_rx` with priority so the Sender's defer walk can never be
    /// starved waiting for a debounced Config flush behind a busy record
    /// channel (§9 REDESIGN FLAGS).
    pub async fn run(
        mut self,
        mut records_rx: mpsc::Receiver<Record>,
        mut control_rx: mpsc::Receiver<HandlerControl>,
    ) -> RuncoreResult<()> {
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;
                control = control_rx.recv(), if control_open => {
                    match control {
                        Some(HandlerControl::FlushDebouncedConfig(reply)) => {
                            self.flush_debounced_config().await?;
                            let _ = reply.send(());
                        }
                        Some(HandlerControl::SeedResume(resume, reply)) => {
                            self.seed_resume(&resume);
                            let _ = reply.send(());
                        }
                        Some(HandlerControl::FileTransferInfo { path }) => {
                            info!(path = %path.display(), "file transfer completed");
                            self.completed_file_transfers.push(path);
                        }
                        None => control_open = false,
                    }
                }
                record = records_rx.recv() => {
                    match record {
                        Some(record) => self.handle(record).await?,
                        None => break,
                    }
                }
            }
        }
        self.mark_finished();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChangeRecord, RecordKind};
    use serde_json::json;

    fn channels() -> (
        mpsc::Sender<Record>,
        mpsc::Receiver<Record>,
        mpsc::Sender<Record>,
        mpsc::Receiver<Record>,
    ) {
        let (wtx, wrx) = mpsc::channel(32);
        let (stx, srx) = mpsc::channel(32);
        (wtx, wrx, stx, srx)
    }

    #[tokio::test]
    async fn first_run_record_transitions_to_upserted() {
        let (wtx, _wrx, stx, _srx) = channels();
        let mut handler = Handler::new(wtx, stx);
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
            start_time: chrono::Utc::now(),
            resume: Default::default(),
        };
        handler.handle(Record::new(RecordKind::Run(run))).await.unwrap();
        assert_eq!(handler.state(), HandlerState::Upserted);
    }

    #[tokio::test]
    async fn config_changes_are_applied_before_forwarding() {
        let (wtx, mut wrx, stx, mut srx) = channels();
        let mut handler = Handler::new(wtx, stx);
        let changes = ChangeSet {
            updates: vec![ChangeRecord {
                path: vec!["lr".into()],
                value: json!(0.1),
            }],
            removes: vec![],
        };
        handler
            .handle(Record::new(RecordKind::Config(changes)))
            .await
            .unwrap();
        assert_eq!(handler.current_config().get_path(&["lr".into()]), Some(&json!(0.1)));
        assert!(wrx.recv().await.is_some());
        assert!(srx.recv().await.is_some());
    }

    #[tokio::test]
    async fn glob_metric_definitions_are_rejected() {
        let (wtx, mut wrx, stx, _srx) = channels();
        let mut handler = Handler::new(wtx, stx);
        let def = crate::record::MetricDefinition {
            name: "loss*".into(),
            step_metric: None,
            step_metric_index: None,
            glob_name: Some("loss*".into()),
            goal: None,
            options: serde_json::Value::Null,
        };
        handler.handle(Record::new(RecordKind::Metric(def))).await.unwrap();
        assert!(wrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn partial_history_synthesizes_a_history_record() {
        let (wtx, mut wrx, stx, _srx) = channels();
        let mut handler = Handler::new(wtx, stx);
        let partial = crate::record::PartialHistoryRecord {
            items: serde_json::Map::new(),
            step: None,
        };
        handler
            .handle(Record::new(RecordKind::Request(RequestKind::PartialHistory(partial))))
            .await
            .unwrap();
        let forwarded = wrx.recv().await.unwrap();
        assert!(matches!(forwarded.kind, RecordKind::History(_)));
    }

    #[tokio::test]
    async fn run_loop_processes_records_and_exits_on_channel_close() {
        let (wtx, mut wrx, stx, _srx) = channels();
        let handler = Handler::new(wtx, stx);
        let (records_tx, records_rx) = mpsc::channel(8);
        let (_control_tx, control_rx) = mpsc::channel(8);

        let task = tokio::spawn(handler.run(records_rx, control_rx));

        records_tx
            .send(Record::new(RecordKind::Config(ChangeSet::default())))
            .await
            .unwrap();
        assert!(wrx.recv().await.is_some());

        drop(records_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_loop_services_flush_debounced_config_control_message() {
        let (wtx, _wrx, stx, mut srx) = channels();
        let handler = Handler::new(wtx, stx);
        let (_records_tx, records_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(8);

        let task = tokio::spawn(handler.run(records_rx, control_rx));

        // Nothing dirty yet: the flush is a no-op but still replies.
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        control_tx
            .send(crate::sender::HandlerControl::FlushDebouncedConfig(reply_tx))
            .await
            .unwrap();
        reply_rx.await.unwrap();
        assert!(srx.try_recv().is_err());

        drop(control_tx);
        drop(_records_tx);
        task.await.unwrap().unwrap();
    }
}
