use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::config_map::ConfigMap;
use super::summary::SummaryMap;

/// Resume policy requested by the client at run start (§3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResumeMode {
    Allow,
    Must,
    Never,
    #[default]
    Auto,
}

/// The four append-only text streams the File-Stream uploader tracks
/// offsets for (§3, §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileStreamChunkType {
    History,
    ConsoleOut,
    ConsoleErr,
    Summary,
    System,
}

pub type FileStreamOffsets = HashMap<FileStreamChunkType, i64>;

/// Everything seeded into a run from a previous run's tail, once a resume
/// mode and `RunResumeStatus` payload have been reconciled (§3, §4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    pub mode: ResumeMode,
    pub file_stream_offsets: FileStreamOffsets,
    pub starting_step: u64,
    pub runtime: f64,
    pub summary_seed: SummaryMap,
    pub config_seed: ConfigMap,
    pub tags_seed: Vec<String>,
    pub resumed_flag: bool,
}
