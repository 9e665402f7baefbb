use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When a declared file should be uploaded (§3, §4.6/§4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SavePolicy {
    /// Upload once, immediately.
    Now,
    /// Stream updates continuously as the file grows.
    Live,
    /// Upload once, at run completion.
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    pub path: PathBuf,
    pub policy: SavePolicy,
}

/// A batch of files the client has declared for upload (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesRecord {
    pub items: Vec<FileItem>,
}
