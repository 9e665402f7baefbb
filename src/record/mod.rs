//! The data model exchanged between every other component: a tagged union
//! of record kinds, each carrying routing metadata and a stable identity
//! (§3). Records are immutable once published; only `RunState`, `ConfigMap`,
//! `SummaryMap` and `MetricDefinitions` accumulate mutable state derived
//! from a record stream.

pub mod config_map;
pub mod control;
pub mod events;
pub mod files;
pub mod history;
pub mod metric;
pub mod output;
pub mod request;
pub mod result;
pub mod resume;
pub mod run_state;
pub mod stats;
pub mod summary;

pub use config_map::{ChangeRecord, ChangeSet, ConfigMap};
pub use control::{new_record_id, Control, RecordId};
pub use events::{AlertLevel, AlertRecord, ExitRecord, LinkArtifactRecord, TelemetryRecord};
pub use files::{FileItem, FilesRecord, SavePolicy};
pub use history::{HistoryRecord, PartialHistoryRecord};
pub use metric::{MetricDefinition, MetricDefinitions};
pub use output::{OutputRawRecord, OutputStream};
pub use request::{DeferPhase, DownloadArtifactRequest, LogArtifactRequest, RequestKind, SyncRequest};
pub use result::{ExitResult, ResultKind, ResultRecord, RunResult};
pub use resume::{FileStreamChunkType, FileStreamOffsets, ResumeMode, ResumeState};
pub use run_state::{RunRecord, RunState};
pub use stats::StatsRecord;
pub use summary::SummaryMap;

use serde::{Deserialize, Serialize};

/// Tagged union of everything that can flow through the Handler/Writer/
/// Sender pipeline (§3). `Header` and `Footer` carry no payload; they mark
/// the boundaries of a transaction log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordKind {
    Header,
    Run(RunRecord),
    History(HistoryRecord),
    Summary(SummaryMap),
    Config(ChangeSet),
    Files(FilesRecord),
    Stats(StatsRecord),
    OutputRaw(OutputRawRecord),
    Telemetry(TelemetryRecord),
    Metric(MetricDefinition),
    Alert(AlertRecord),
    LinkArtifact(LinkArtifactRecord),
    Exit(ExitRecord),
    Request(RequestKind),
    Result(ResultRecord),
    Footer,
}

impl RecordKind {
    /// Requests and results are transient routing vehicles; everything else
    /// gets appended to the transaction log (§4.5, §6).
    pub fn is_persistable(&self) -> bool {
        !matches!(self, RecordKind::Request(_) | RecordKind::Result(_))
    }
}

/// Envelope wrapping every [`RecordKind`] with its identity and routing
/// metadata (§3). Records are immutable once published: nothing after
/// construction may mutate `id` or `control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub control: Control,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            id: new_record_id(),
            control: Control::default(),
            kind,
        }
    }

    pub fn with_control(kind: RecordKind, control: Control) -> Self {
        Self {
            id: new_record_id(),
            control,
            kind,
        }
    }
}
