use serde::{Deserialize, Serialize};

use super::run_state::RunRecord;

/// The fixed walk order of the deferred-shutdown state machine (§4.10,
/// §9 REDESIGN FLAGS: modeled as an explicit state table rather than a
/// re-queued switch).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeferPhase {
    Begin,
    FlushRun,
    FlushStats,
    FlushPartialHistory,
    FlushTb,
    FlushSum,
    FlushDebouncer,
    FlushOutput,
    FlushJob,
    FlushDir,
    FlushFp,
    JoinFp,
    FlushFs,
    FlushFinal,
    End,
}

impl DeferPhase {
    pub const ORDER: [DeferPhase; 15] = [
        DeferPhase::Begin,
        DeferPhase::FlushRun,
        DeferPhase::FlushStats,
        DeferPhase::FlushPartialHistory,
        DeferPhase::FlushTb,
        DeferPhase::FlushSum,
        DeferPhase::FlushDebouncer,
        DeferPhase::FlushOutput,
        DeferPhase::FlushJob,
        DeferPhase::FlushDir,
        DeferPhase::FlushFp,
        DeferPhase::JoinFp,
        DeferPhase::FlushFs,
        DeferPhase::FlushFinal,
        DeferPhase::End,
    ];

    /// The next phase in the walk, or `None` once `End` is reached.
    pub fn next(self) -> Option<DeferPhase> {
        let idx = Self::ORDER.iter().position(|p| *p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub log_path: std::path::PathBuf,
    pub overwrite_entity: Option<String>,
    pub overwrite_project: Option<String>,
    pub overwrite_run_id: Option<String>,
    pub skip_output_raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArtifactRequest {
    pub artifact_type: String,
    pub name: String,
    pub paths: Vec<std::path::PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadArtifactRequest {
    pub artifact_id: String,
    pub download_root: std::path::PathBuf,
}

/// Tagged union of request kinds (§3). Requests are the only record kind
/// never persisted to the transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestKind {
    RunStart(RunRecord),
    Defer(DeferPhase),
    NetworkStatus,
    LogArtifact(LogArtifactRequest),
    DownloadArtifact(DownloadArtifactRequest),
    ServerInfo,
    Sync(SyncRequest),
    SenderRead,
    PartialHistory(super::history::PartialHistoryRecord),
    PollExit,
    Cancel,
}
