use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of captured console output (§3). Routed to the console-out or
/// console-err File-Stream chunk depending on `stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRawRecord {
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}
