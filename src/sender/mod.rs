//! GraphQL interactions, resume, file-upload orchestration, the defer
//! walk, and exit response (§4.10). Owns the transport's rate-limit
//! tracker (via `Transport`), the `SavedFile` set, and the upload batcher
//! (§5 shared-resource policy).

pub mod graphql;
pub mod resume;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::batcher::UploadBatcher;
use crate::error::{RuncoreError, RuncoreResult};
use crate::filestream::FileStreamUploader;
use crate::record::{
    AlertRecord, ConfigMap, DeferPhase, ExitResult, FileItem, FilesRecord, LinkArtifactRecord, MetricDefinition,
    MetricDefinitions, OutputRawRecord, OutputStream, Record, RecordKind, RequestKind, ResumeMode, ResumeState,
    ResultKind, ResultRecord, RunRecord, RunState, SavePolicy, StatsRecord,
};
use crate::saved_file::SavedFile;
use crate::transport::Transport;
use crate::watcher::{WatchEvent, Watcher};
use crate::wire::mux::Mux;

use resume::RunResumeStatus;

/// How often the File-Stream uploader flushes its buffered lines in the
/// background, independent of the Close-time final flush (§4.7).
const FILE_STREAM_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

type LiveUploadCallback = Box<
    dyn Fn(Vec<PathBuf>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Internal bookkeeping category for an uploaded file (§3). Not part of
/// the wire model; kept only so `sendFiles` can route media paths
/// differently from everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileCategory {
    Wandb,
    Media,
    Artifact,
    Other,
}

impl FileCategory {
    fn as_str(self) -> &'static str {
        match self {
            FileCategory::Wandb => "WANDB",
            FileCategory::Media => "MEDIA",
            FileCategory::Artifact => "ARTIFACT",
            FileCategory::Other => "OTHER",
        }
    }
}

/// Told to the Handler with priority over the inbound record stream, so
/// the debounced Config flush can't be starved by a busy record channel
/// (§9 REDESIGN FLAGS: break the Sender↔Handler cycle via a dedicated
/// control channel rather than re-queuing Defer through the forward
/// channel).
pub enum HandlerControl {
    FlushDebouncedConfig(oneshot::Sender<()>),
    /// Sent once, synchronously, after resume reconciliation resolves and
    /// before the `Run` result is replied to the client, so the Handler's
    /// `_step`/`_runtime` counters and summary seed are in place before any
    /// `PartialHistory` the client sends next reaches it (§4.12).
    SeedResume(ResumeState, oneshot::Sender<()>),
    /// Posted by an `UploadTask`'s completion callback on success, for UI
    /// accounting of finished file transfers (§4.10 sendFiles). Fire and
    /// forget: no reply is expected.
    FileTransferInfo { path: PathBuf },
}

struct FileState {
    saved: Arc<SavedFile>,
    policy: SavePolicy,
    url: String,
}

/// Consumes the same record stream the Writer does, owns everything that
/// talks to the backend (§4.10).
pub struct Sender {
    transport: Arc<Transport>,
    mux: Mux,
    run_dir: PathBuf,
    resume_mode: ResumeMode,
    run: Option<RunState>,
    config: ConfigMap,
    metrics: MetricDefinitions,
    file_stream: Option<Arc<FileStreamUploader>>,
    file_stream_stop: Option<Arc<tokio::sync::Notify>>,
    files: Arc<Mutex<HashMap<PathBuf, FileState>>>,
    live_watcher: Option<Arc<Watcher>>,
    batcher: Option<Arc<UploadBatcher<LiveUploadCallback>>>,
    handler_control: mpsc::Sender<HandlerControl>,
    exit_reply: Option<(String, crate::record::RecordId)>,
    exit_code: i32,
    watcher_poll_period: Duration,
}

impl Sender {
    pub fn new(
        transport: Arc<Transport>,
        mux: Mux,
        run_dir: PathBuf,
        resume_mode: ResumeMode,
        handler_control: mpsc::Sender<HandlerControl>,
    ) -> Self {
        Self {
            transport,
            mux,
            run_dir,
            resume_mode,
            run: None,
            config: ConfigMap::default(),
            metrics: MetricDefinitions::default(),
            file_stream: None,
            file_stream_stop: None,
            files: Arc::new(Mutex::new(HashMap::new())),
            live_watcher: None,
            batcher: None,
            handler_control,
            exit_reply: None,
            exit_code: 0,
            watcher_poll_period: crate::watcher::DEFAULT_POLLING_PERIOD,
        }
    }

    /// Overrides the Live-file poll watcher's period from `ServiceConfig.
    /// watcher.polling_period` rather than the built-in default (§4.4).
    pub fn with_watcher_poll_period(mut self, period: Duration) -> Self {
        self.watcher_poll_period = period;
        self
    }

    /// Main record-consumption loop (§4.10, §5: one Sender task per
    /// Stream).
    pub async fn run(mut self, mut rx: mpsc::Receiver<Record>) -> RuncoreResult<()> {
        while let Some(record) = rx.recv().await {
            if let Err(e) = self.handle(record).await {
                warn!(error = %e, "sender failed to process record");
            }
        }
        Ok(())
    }

    async fn handle(&mut self, record: Record) -> RuncoreResult<()> {
        let control = record.control.clone();
        match record.kind {
            RecordKind::Run(run) => self.send_run(run, &control).await?,
            RecordKind::Config(changes) => {
                self.config.apply(&changes);
                self.send_config().await?;
            }
            RecordKind::History(history) => {
                if let Some(fs) = &self.file_stream {
                    fs.append_history(serde_json::to_string(&history.items)?);
                }
            }
            RecordKind::Summary(summary) => {
                if let Some(fs) = &self.file_stream {
                    fs.append_summary(serde_json::to_string(&summary.to_json())?);
                }
            }
            RecordKind::Stats(stats) => self.send_system_metrics(&stats).await,
            RecordKind::OutputRaw(out) => self.send_output_raw(&out).await?,
            RecordKind::Metric(def) => self.send_metric(def).await?,
            RecordKind::Files(files) => self.send_files(files, &control).await?,
            RecordKind::Alert(alert) => self.send_alert(&alert).await,
            RecordKind::LinkArtifact(link) => self.send_link_artifact(&link, &control).await,
            RecordKind::Exit(exit) => self.send_exit(exit.exit_code, &control).await?,
            RecordKind::Request(RequestKind::Defer(phase)) => self.advance_defer(phase).await?,
            RecordKind::Request(RequestKind::LogArtifact(req)) => {
                self.send_log_artifact(&req, &control).await
            }
            RecordKind::Request(RequestKind::DownloadArtifact(req)) => {
                self.send_download_artifact(&req, &control).await
            }
            _ => {}
        }
        Ok(())
    }

    fn reply(&self, control: &crate::record::Control, in_reply_to: crate::record::RecordId, kind: ResultKind) {
        if !control.wants_reply() || control.connection_id.is_empty() {
            return;
        }
        let result = ResultRecord { in_reply_to, kind };
        if let Err(e) = self.mux.route_result(&control.connection_id, result) {
            warn!(error = %e, "failed to route result back to connection");
        }
    }

    async fn send_run(&mut self, run: RunRecord, control: &crate::record::Control) -> RuncoreResult<()> {
        let mut resumed = false;
        let mut file_stream_offsets = crate::record::FileStreamOffsets::new();
        if matches!(self.resume_mode, ResumeMode::Allow | ResumeMode::Must | ResumeMode::Auto) {
            let status = self.fetch_run_resume_status(&run.entity, &run.project, &run.id).await?;
            match resume::reconcile(self.resume_mode, &run.project, &run.id, &status) {
                Ok(seed) => {
                    self.apply_resume_seed(&seed);
                    resumed = seed.resumed_flag;
                    file_stream_offsets = seed.file_stream_offsets.clone();

                    let (tx, rx) = oneshot::channel();
                    if self
                        .handler_control
                        .send(HandlerControl::SeedResume(seed, tx))
                        .await
                        .is_ok()
                    {
                        let _ = rx.await;
                    }
                }
                Err(e) => {
                    self.reply(
                        control,
                        crate::record::new_record_id(),
                        ResultKind::Response(serde_json::json!({ "error": e.to_string() })),
                    );
                    return Err(e);
                }
            }
        }

        self.config.apply(&crate::record::ChangeSet {
            updates: run
                .config
                .0
                .iter()
                .map(|(k, v)| crate::record::ChangeRecord {
                    path: vec![k.clone()],
                    value: v.clone(),
                })
                .collect(),
            removes: vec![],
        });

        let mut state = RunState::from_run_record(&run);
        state.resumed = resumed;

        let variables = graphql::upsert_bucket_variables(&run, &self.config);
        let response = self.transport.execute_graphql(graphql::UPSERT_BUCKET, variables).await?;
        let bucket = &response["data"]["upsertBucket"]["bucket"];
        if let (Some(display_name), Some(project), Some(entity)) = (
            bucket["displayName"].as_str(),
            bucket["project"]["name"].as_str(),
            bucket["entity"]["name"].as_str(),
        ) {
            state.merge_canonical(display_name, project, entity);
        }

        let file_stream = Arc::new(FileStreamUploader::new(
            Arc::clone(&self.transport),
            format!(
                "{}/files/{}/{}/{}/file_stream",
                self.transport_base_url(),
                state.entity,
                state.project,
                state.id
            ),
            file_stream_offsets,
        ));
        let stop = Arc::new(tokio::sync::Notify::new());
        spawn_file_stream_flusher(Arc::clone(&file_stream), Arc::clone(&stop));
        self.file_stream = Some(file_stream);
        self.file_stream_stop = Some(stop);

        self.run = Some(state.clone());
        self.reply(
            control,
            crate::record::new_record_id(),
            ResultKind::Run(crate::record::RunResult { state, resumed }),
        );
        Ok(())
    }

    fn transport_base_url(&self) -> String {
        self.transport.base_url().to_string()
    }

    async fn fetch_run_resume_status(&self, entity: &str, project: &str, run_id: &str) -> RuncoreResult<RunResumeStatus> {
        let variables = graphql::run_resume_status_variables(entity, project, run_id);
        let response = self.transport.execute_graphql(graphql::RUN_RESUME_STATUS, variables).await?;
        let bucket = &response["data"]["bucket"];
        if bucket.is_null() {
            return Ok(RunResumeStatus {
                exists: false,
                history_line_count: 0,
                events_line_count: 0,
                log_line_count: 0,
                history_tail: vec![],
                summary_metrics: None,
                config: None,
                tags: vec![],
            });
        }
        Ok(RunResumeStatus {
            exists: true,
            history_line_count: bucket["historyLineCount"].as_u64().unwrap_or(0),
            events_line_count: bucket["eventsLineCount"].as_i64().unwrap_or(0),
            log_line_count: bucket["logLineCount"].as_i64().unwrap_or(0),
            history_tail: bucket["historyTail"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            summary_metrics: bucket["summaryMetrics"].as_str().map(str::to_string),
            config: bucket["config"].as_str().map(str::to_string),
            tags: bucket["tags"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        })
    }

    fn apply_resume_seed(&mut self, seed: &ResumeState) {
        self.config.apply(&crate::record::ChangeSet {
            updates: seed
                .config_seed
                .0
                .iter()
                .map(|(k, v)| crate::record::ChangeRecord {
                    path: vec![k.clone()],
                    value: v.clone(),
                })
                .collect(),
            removes: vec![],
        });
    }

    /// Marshals `ConfigMap` for `UpsertBucket` and writes `config.yaml`
    /// on disk (§4.10, §6).
    async fn send_config(&self) -> RuncoreResult<()> {
        let path = self.run_dir.join("config.yaml");
        let yaml = self.config.to_yaml_string()?;
        if let Err(e) = tokio::fs::write(&path, yaml).await {
            warn!(error = %e, path = %path.display(), "failed to write config.yaml");
        }
        Ok(())
    }

    async fn send_system_metrics(&self, stats: &StatsRecord) {
        if let Some(fs) = &self.file_stream {
            if let Ok(line) = serde_json::to_string(&stats.items) {
                fs.append_stats(line);
            }
        }
    }

    /// Output-raw lines are appended both to the File-Stream and the local
    /// `output.log`; a bare `"\n"` line is dropped (§4.10).
    async fn send_output_raw(&self, out: &OutputRawRecord) -> RuncoreResult<()> {
        if out.line == "\n" {
            return Ok(());
        }
        let timestamp = out.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, false);
        let timestamp = timestamp.trim_end_matches('Z');
        let prefixed = match out.stream {
            OutputStream::Stdout => format!("{timestamp} {}", out.line),
            OutputStream::Stderr => format!("{timestamp} ERROR {}", out.line),
        };

        if let Some(fs) = &self.file_stream {
            fs.append_output(out.stream, prefixed.clone());
        }

        let path = self.run_dir.join("output.log");
        match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                if let Err(e) = file.write_all(format!("{prefixed}\n").as_bytes()).await {
                    warn!(error = %e, "failed writing output.log");
                }
            }
            Err(e) => warn!(error = %e, "failed to open output.log"),
        }
        Ok(())
    }

    /// Rejects glob definitions, mirrors into `_wandb.m`, resolves
    /// `step_metric_index`, then triggers `sendConfig` (§4.10).
    async fn send_metric(&mut self, def: MetricDefinition) -> RuncoreResult<()> {
        if def.glob_name.is_some() {
            warn!(name = %def.name, "glob metric definitions are rejected");
            return Ok(());
        }
        self.metrics.append(def);
        self.config.set_path(
            &[crate::record::config_map::RESERVED_KEY.to_string(), "m".to_string()],
            self.metrics.to_json(),
        );
        self.send_config().await
    }

    /// Media paths are re-categorized, presigned URLs are fetched in one
    /// batch, and each file's upload is scheduled per its policy (§4.10).
    async fn send_files(&mut self, files: FilesRecord, control: &crate::record::Control) -> RuncoreResult<()> {
        let run = self.run.clone().ok_or_else(|| RuncoreError::Internal("Files record before Run".to_string()))?;

        let mut existing = Vec::new();
        for item in &files.items {
            if tokio::fs::metadata(&item.path).await.is_ok() {
                existing.push(item.clone());
            } else {
                warn!(path = %item.path.display(), "declared file does not exist, skipping upload");
            }
        }
        if existing.is_empty() {
            return Ok(());
        }

        let named: Vec<(String, String)> = existing
            .iter()
            .map(|item| {
                let category = categorize(&item.path);
                (item.path.display().to_string(), category.as_str().to_string())
            })
            .collect();

        let variables = graphql::create_run_files_variables(&run.entity, &run.project, &run.id, &named);
        let response = self
            .transport
            .execute_graphql(graphql::CREATE_RUN_FILES, variables)
            .await?;
        let entries = response["data"]["createRunFiles"]["files"].as_array().cloned().unwrap_or_default();

        for item in existing {
            let url = entries
                .iter()
                .find(|e| e["name"].as_str() == Some(item.path.display().to_string().as_str()))
                .and_then(|e| e["uploadUrl"].as_str())
                .map(str::to_string);
            let Some(url) = url else {
                warn!(path = %item.path.display(), "no presigned url returned for file");
                continue;
            };
            self.schedule_file(item, url).await;
        }

        self.reply(control, crate::record::new_record_id(), ResultKind::Response(serde_json::Value::Null));
        Ok(())
    }

    async fn schedule_file(&mut self, item: FileItem, url: String) {
        let transport = Arc::clone(&self.transport);
        let handler_control = self.handler_control.clone();
        let saved = SavedFile::new(
            item.path.clone(),
            move |path, url| {
                let transport = Arc::clone(&transport);
                Box::pin(async move {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .map_err(|source| RuncoreError::Io { source, path: Some(path.clone()) })?;
                    transport.upload_bytes(&url, bytes).await
                })
            },
            move |path| {
                let handler_control = handler_control.clone();
                let path = path.to_path_buf();
                tokio::spawn(async move {
                    let _ = handler_control.send(HandlerControl::FileTransferInfo { path }).await;
                });
            },
        );

        match item.policy {
            SavePolicy::Now => saved.upload(url.clone()),
            SavePolicy::Live => {
                saved.upload(url.clone());
                self.watch_live_file(&item.path).await;
            }
            // Uploaded once at FLUSH_FP, not at declaration time (§4.6, §4.10).
            SavePolicy::End => {}
        }

        self.files.lock().await.insert(
            item.path.clone(),
            FileState { saved, policy: item.policy, url },
        );
    }

    /// Lazily starts one shared poll watcher plus a coalescing batcher for
    /// every `Live`-policy file; a burst of near-simultaneous change events
    /// across files collapses into one dispatched re-upload round per file
    /// rather than firing an upload per event (§4.5, §4.6).
    async fn watch_live_file(&mut self, path: &Path) {
        if self.live_watcher.is_none() {
            let (watcher, mut events) = Watcher::new(self.watcher_poll_period);
            let watcher = Arc::new(watcher);
            let runner = Arc::clone(&watcher);
            tokio::spawn(async move { runner.run().await });

            let files_for_batcher = Arc::clone(&self.files);
            let batcher = Arc::new(UploadBatcher::new(
                Duration::from_millis(200),
                Box::new(move |paths: Vec<PathBuf>| {
                    let files = Arc::clone(&files_for_batcher);
                    Box::pin(async move {
                        let files = files.lock().await;
                        for path in paths {
                            if let Some(state) = files.get(&path) {
                                if state.policy == SavePolicy::Live {
                                    state.saved.upload(state.url.clone());
                                }
                            }
                        }
                    }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
                }) as LiveUploadCallback,
            ));

            let files_for_watch = Arc::clone(&self.files);
            let forward_batcher = Arc::clone(&batcher);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let WatchEvent::Changed(path) = event else { continue };
                    if files_for_watch.lock().await.contains_key(&path) {
                        forward_batcher.add(vec![path]).await;
                    }
                }
            });

            self.live_watcher = Some(watcher);
            self.batcher = Some(batcher);
        }
        if let Some(watcher) = &self.live_watcher {
            let _ = watcher.watch(path).await;
        }
    }

    async fn send_alert(&self, alert: &AlertRecord) {
        let Some(run) = &self.run else { return };
        let variables = graphql::notify_scriptable_run_alert_variables(
            &run.entity,
            &run.project,
            &run.id,
            &alert.title,
            &alert.text,
            match alert.level {
                crate::record::AlertLevel::Info => "INFO",
                crate::record::AlertLevel::Warn => "WARN",
                crate::record::AlertLevel::Error => "ERROR",
            },
        );
        if let Err(e) = self.transport.execute_graphql(graphql::NOTIFY_SCRIPTABLE_RUN_ALERT, variables).await {
            warn!(error = %e, "failed to send run alert");
        }
    }

    async fn send_link_artifact(&self, link: &LinkArtifactRecord, control: &crate::record::Control) {
        let variables = graphql::link_artifact_variables(&link.artifact_id, &link.portfolio_name);
        match self.transport.execute_graphql(graphql::LINK_ARTIFACT, variables).await {
            Ok(response) => self.reply(control, crate::record::new_record_id(), ResultKind::Response(response)),
            Err(e) => warn!(error = %e, "link artifact failed"),
        }
    }

    async fn send_log_artifact(&self, req: &crate::record::LogArtifactRequest, control: &crate::record::Control) {
        let Some(run) = &self.run else { return };
        let variables = graphql::create_artifact_variables(&run.entity, &run.project, &run.id, &req.artifact_type, &req.name);
        let created = match self.transport.execute_graphql(graphql::CREATE_ARTIFACT, variables).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "create artifact failed");
                return;
            }
        };
        let Some(artifact_id) = created["data"]["createArtifact"]["artifact"]["id"].as_str() else {
            return;
        };
        let commit_variables = graphql::commit_artifact_variables(artifact_id);
        match self.transport.execute_graphql(graphql::COMMIT_ARTIFACT, commit_variables).await {
            Ok(response) => self.reply(control, crate::record::new_record_id(), ResultKind::Response(response)),
            Err(e) => warn!(error = %e, "commit artifact failed"),
        }
    }

    async fn send_download_artifact(&self, req: &crate::record::DownloadArtifactRequest, control: &crate::record::Control) {
        let variables = graphql::download_artifact_variables(&req.artifact_id);
        match self.transport.execute_graphql(graphql::DOWNLOAD_ARTIFACT, variables).await {
            Ok(response) => self.reply(control, crate::record::new_record_id(), ResultKind::Response(response)),
            Err(e) => warn!(error = %e, "download artifact failed"),
        }
    }

    /// Forwards Exit to the File-Stream and kicks off the defer walk
    /// (§4.10).
    async fn send_exit(&mut self, exit_code: i32, control: &crate::record::Control) -> RuncoreResult<()> {
        self.exit_code = exit_code;
        if !control.connection_id.is_empty() {
            self.exit_reply = Some((control.connection_id.clone(), crate::record::new_record_id()));
        }
        self.advance_defer(DeferPhase::Begin).await
    }

    /// Walks the fixed defer phase table to completion, performing each
    /// phase's action in sequence rather than re-queuing a message through
    /// the record channels (§4.10, §9 REDESIGN FLAGS).
    async fn advance_defer(&mut self, phase: DeferPhase) -> RuncoreResult<()> {
        self.run_defer_phase(phase).await?;
        let mut current = phase;
        while let Some(next) = current.next() {
            self.run_defer_phase(next).await?;
            current = next;
        }
        Ok(())
    }

    async fn run_defer_phase(&mut self, phase: DeferPhase) -> RuncoreResult<()> {
        match phase {
            DeferPhase::Begin | DeferPhase::FlushRun | DeferPhase::FlushStats | DeferPhase::FlushPartialHistory
            | DeferPhase::FlushTb | DeferPhase::FlushSum => {}
            DeferPhase::FlushDebouncer => {
                let (tx, rx) = oneshot::channel();
                if self
                    .handler_control
                    .send(HandlerControl::FlushDebouncedConfig(tx))
                    .await
                    .is_ok()
                {
                    let _ = rx.await;
                }
                self.send_config().await?;
            }
            DeferPhase::FlushOutput | DeferPhase::FlushJob | DeferPhase::FlushDir => {}
            DeferPhase::FlushFp => {
                let files = self.files.lock().await;
                for state in files.values() {
                    match state.policy {
                        SavePolicy::End => {
                            state.saved.upload(state.url.clone());
                            state.saved.finish().await;
                        }
                        // One last upload catches any write the poll watcher
                        // hadn't yet noticed before shutdown (§8 S4: "again
                        // at end-of-run").
                        SavePolicy::Live => state.saved.upload(state.url.clone()),
                        SavePolicy::Now => {}
                    }
                }
            }
            DeferPhase::JoinFp => {
                let files = self.files.lock().await;
                for state in files.values() {
                    state.saved.finish().await;
                }
                if let Some(watcher) = &self.live_watcher {
                    watcher.finish();
                }
            }
            DeferPhase::FlushFs => {
                if let Some(stop) = self.file_stream_stop.take() {
                    stop.notify_one();
                }
                if let Some(fs) = &self.file_stream {
                    let exit_code = self.last_exit_code();
                    fs.close(exit_code).await?;
                }
            }
            DeferPhase::FlushFinal => {}
            DeferPhase::End => {
                if let Some((connection_id, in_reply_to)) = self.exit_reply.take() {
                    let result = ResultRecord {
                        in_reply_to,
                        kind: ResultKind::Exit(ExitResult { exit_code: self.last_exit_code() }),
                    };
                    if let Err(e) = self.mux.route_result(&connection_id, result) {
                        warn!(error = %e, "failed to deliver exit result");
                    }
                }
                info!("defer walk reached END");
            }
        }
        Ok(())
    }

    fn last_exit_code(&self) -> i32 {
        self.exit_code
    }
}

/// Ticks a background flush of `file_stream` until `stop` fires, so buffered
/// history/summary/stats/output lines reach the backend periodically rather
/// than only at Close (§4.7: "Periodically (or on Close) POSTs").
fn spawn_file_stream_flusher(file_stream: Arc<FileStreamUploader>, stop: Arc<tokio::sync::Notify>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FILE_STREAM_FLUSH_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = file_stream.flush(None, None).await {
                        warn!(error = %e, "periodic filestream flush failed");
                    }
                }
                _ = stop.notified() => break,
            }
        }
    });
}

fn categorize(path: &Path) -> FileCategory {
    if path.starts_with("media") {
        FileCategory::Media
    } else {
        FileCategory::Wandb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Control;
    use crate::transport::TransportConfig;

    fn test_sender(run_dir: PathBuf) -> Sender {
        let transport = Arc::new(Transport::new(TransportConfig::default()).unwrap());
        let (handler_control, _rx) = mpsc::channel(1);
        Sender::new(transport, Mux::new(), run_dir, ResumeMode::Never, handler_control)
    }

    #[test]
    fn categorize_routes_media_paths_separately() {
        assert_eq!(categorize(Path::new("media/images/x.png")), FileCategory::Media);
        assert_eq!(categorize(Path::new("checkpoints/model.pt")), FileCategory::Wandb);
    }

    #[tokio::test]
    async fn end_policy_files_are_not_uploaded_until_flush_fp() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = test_sender(dir.path().to_path_buf());

        let item = FileItem { path: PathBuf::from("run-summary.json"), policy: SavePolicy::End };
        sender.schedule_file(item.clone(), "https://example/upload".to_string()).await;

        let files = sender.files.lock().await;
        let state = files.get(&item.path).unwrap();
        assert_eq!(state.policy, SavePolicy::End);
        assert_eq!(state.url, "https://example/upload");
    }

    #[tokio::test]
    async fn uploading_a_file_posts_file_transfer_info_to_the_handler() {
        use wiremock::matchers::{method, path as path_matcher};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let backend = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_matcher("/upload/a.txt"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&backend)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        tokio::fs::write(&file_path, b"hello").await.unwrap();

        let transport = Arc::new(Transport::new(TransportConfig { base_url: backend.uri(), ..TransportConfig::default() }).unwrap());
        let (handler_control, mut control_rx) = mpsc::channel(8);
        let mut sender = Sender::new(transport, Mux::new(), dir.path().to_path_buf(), ResumeMode::Never, handler_control);

        let item = FileItem { path: file_path.clone(), policy: SavePolicy::Now };
        sender.schedule_file(item, format!("{}/upload/a.txt", backend.uri())).await;

        let message = tokio::time::timeout(Duration::from_secs(5), control_rx.recv())
            .await
            .expect("a FileTransferInfo message should arrive")
            .expect("the control channel should still be open");
        match message {
            HandlerControl::FileTransferInfo { path } => assert_eq!(path, file_path),
            _ => panic!("expected FileTransferInfo"),
        }
    }

    #[tokio::test]
    async fn send_exit_propagates_the_real_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = test_sender(dir.path().to_path_buf());

        sender.send_exit(7, &Control::default()).await.unwrap();
        assert_eq!(sender.last_exit_code(), 7);
    }
}
