//! Owns per-chunk-type offsets and batches record fragments into periodic
//! POSTs against the per-run filestream URL (§4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::warn;

use crate::error::RuncoreResult;
use crate::record::{FileStreamChunkType, FileStreamOffsets, OutputStream};
use crate::transport::Transport;

fn path_for(chunk: FileStreamChunkType) -> &'static str {
    match chunk {
        FileStreamChunkType::History => "wandb-history.jsonl",
        FileStreamChunkType::Summary => "wandb-summary.json",
        FileStreamChunkType::System => "wandb-events.jsonl",
        FileStreamChunkType::ConsoleOut | FileStreamChunkType::ConsoleErr => "output.log",
    }
}

/// Buffers pending lines per chunk type and flushes them to the backend,
/// resuming from offsets seeded by a prior run (§4.7, §4.12).
pub struct FileStreamUploader {
    transport: Arc<Transport>,
    url: String,
    offsets: Mutex<FileStreamOffsets>,
    buffers: Mutex<HashMap<FileStreamChunkType, Vec<String>>>,
    dropped_chunks: AtomicU64,
}

impl FileStreamUploader {
    pub fn new(transport: Arc<Transport>, url: String, initial_offsets: FileStreamOffsets) -> Self {
        Self {
            transport,
            url,
            offsets: Mutex::new(initial_offsets),
            buffers: Mutex::new(HashMap::new()),
            dropped_chunks: AtomicU64::new(0),
        }
    }

    pub fn append_history(&self, line: String) {
        self.append(FileStreamChunkType::History, line);
    }

    pub fn append_summary(&self, line: String) {
        self.append(FileStreamChunkType::Summary, line);
    }

    pub fn append_stats(&self, line: String) {
        self.append(FileStreamChunkType::System, line);
    }

    /// STDERR lines are prefixed with `"ERROR "` before being buffered
    /// (§4.7).
    pub fn append_output(&self, stream: OutputStream, line: String) {
        match stream {
            OutputStream::Stdout => self.append(FileStreamChunkType::ConsoleOut, line),
            OutputStream::Stderr => {
                self.append(FileStreamChunkType::ConsoleErr, format!("ERROR {line}"))
            }
        }
    }

    fn append(&self, chunk: FileStreamChunkType, line: String) {
        self.buffers.lock().unwrap().entry(chunk).or_default().push(line);
    }

    /// Drain the buffers and POST one body to the filestream URL. On
    /// persistent failure, the pending lines are logged and dropped
    /// rather than retried forever (§4.7).
    pub async fn flush(&self, complete: Option<bool>, exit_code: Option<i32>) -> RuncoreResult<()> {
        let drained: HashMap<FileStreamChunkType, Vec<String>> =
            std::mem::take(&mut *self.buffers.lock().unwrap());

        if drained.is_empty() && complete.is_none() {
            return Ok(());
        }

        let mut files = serde_json::Map::new();
        let offsets_snapshot = self.offsets.lock().unwrap().clone();
        for (chunk, lines) in &drained {
            if lines.is_empty() {
                continue;
            }
            let offset = *offsets_snapshot.get(chunk).unwrap_or(&0);
            files.insert(
                path_for(*chunk).to_string(),
                json!({ "offset": offset, "content": lines }),
            );
        }

        let mut body = json!({
            "files": files,
            "dropped_chunks": self.dropped_chunks.load(Ordering::Relaxed),
        });
        if let Some(complete) = complete {
            body["complete"] = json!(complete);
        }
        if let Some(exit_code) = exit_code {
            body["exitcode"] = json!(exit_code);
        }

        match self.transport.post_json(&self.url, body).await {
            Ok(_) => {
                let mut offsets = self.offsets.lock().unwrap();
                for (chunk, lines) in &drained {
                    *offsets.entry(*chunk).or_insert(0) += lines.len() as i64;
                }
                Ok(())
            }
            Err(e) => {
                let dropped: u64 = drained.values().map(|lines| lines.len() as u64).sum();
                self.dropped_chunks.fetch_add(dropped, Ordering::Relaxed);
                warn!(error = %e, dropped, "filestream flush failed, dropping buffered lines");
                Ok(())
            }
        }
    }

    /// Final flush, marking the stream complete (§4.7).
    pub async fn close(&self, exit_code: i32) -> RuncoreResult<()> {
        self.flush(Some(true), Some(exit_code)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_lines_get_error_prefix() {
        let transport = Arc::new(Transport::new(Default::default()).unwrap());
        let uploader = FileStreamUploader::new(transport, "http://x/filestream".into(), HashMap::new());
        uploader.append_output(OutputStream::Stderr, "boom".to_string());
        let buffers = uploader.buffers.lock().unwrap();
        assert_eq!(
            buffers.get(&FileStreamChunkType::ConsoleErr).unwrap()[0],
            "ERROR boom"
        );
    }

    #[test]
    fn history_and_output_route_to_distinct_files() {
        assert_eq!(path_for(FileStreamChunkType::History), "wandb-history.jsonl");
        assert_eq!(path_for(FileStreamChunkType::ConsoleOut), "output.log");
        assert_eq!(path_for(FileStreamChunkType::ConsoleErr), "output.log");
    }
}
