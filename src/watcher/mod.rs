//! Single-threaded poll loop watching a set of paths for size/mtime
//! changes (§4.4). Polling only: this process has no dependency on a
//! native OS notification backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RuncoreResult;

pub const DEFAULT_POLLING_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ModToken {
    size: u64,
    mtime: Option<SystemTime>,
}

fn stat(path: &Path) -> Option<ModToken> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(ModToken {
        size: metadata.len(),
        mtime: metadata.modified().ok(),
    })
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A watched path's contents changed. Polling cannot distinguish a
    /// fresh write from a truncate-then-rewrite, so both collapse here
    /// (§4.4).
    Changed(PathBuf),
    /// Emitted only for the existing children of a newly watched
    /// directory, giving consumers a starting catalog (§4.4).
    Created(PathBuf),
}

/// Registers paths and emits [`WatchEvent`]s at a fixed polling period.
pub struct Watcher {
    poll_period: Duration,
    watched: Arc<DashMap<PathBuf, ModToken>>,
    events: mpsc::Sender<WatchEvent>,
    finished: Arc<AtomicBool>,
}

impl Watcher {
    pub fn new(poll_period: Duration) -> (Self, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                poll_period,
                watched: Arc::new(DashMap::new()),
                events: tx,
                finished: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Register a single path. The first watch of a path never emits a
    /// synthetic event for existing content; watching a directory instead
    /// synthesizes [`WatchEvent::Created`] for each existing child so
    /// consumers get a starting catalog (§4.4).
    pub async fn watch(&self, path: impl Into<PathBuf>) -> RuncoreResult<()> {
        let path = path.into();
        if path.is_dir() {
            let mut entries = tokio::fs::read_dir(&path).await.map_err(|source| {
                crate::error::RuncoreError::Io {
                    source,
                    path: Some(path.clone()),
                }
            })?;
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(_) => break,
                };
                let child = entry.path();
                if let Some(token) = stat(&child) {
                    self.watched.insert(child.clone(), token);
                    self.emit(WatchEvent::Created(child)).await;
                }
            }
        } else if let Some(token) = stat(&path) {
            self.watched.insert(path, token);
        }
        Ok(())
    }

    /// Walk a subtree, following symlinks to files but not directories,
    /// refreshing every mod-token in one pass (§4.4).
    pub fn watch_tree(&self, root: impl Into<PathBuf>) -> RuncoreResult<()> {
        let root = root.into();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let file_type = match entry.file_type() {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    stack.push(path);
                } else if let Some(token) = stat(&path) {
                    self.watched.insert(path, token);
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, event: WatchEvent) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("watch event receiver dropped");
        }
    }

    /// Poll every registered path once per `poll_period` until [`Watcher::finish`]
    /// is called. Guaranteed to notice `finish` within one polling period
    /// (§5).
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_period);
        loop {
            interval.tick().await;
            if self.finished.load(Ordering::Acquire) {
                break;
            }
            let mut changed: HashMap<PathBuf, ModToken> = HashMap::new();
            for mut entry in self.watched.iter_mut() {
                let path = entry.key().clone();
                if let Some(token) = stat(&path) {
                    if token != *entry.value() {
                        *entry.value_mut() = token;
                        changed.insert(path, token);
                    }
                } else {
                    warn!(path = %path.display(), "watched path disappeared");
                }
            }
            for path in changed.into_keys() {
                self.emit(WatchEvent::Changed(path)).await;
            }
        }
    }

    /// Idempotent. After `finish`, no further events fire even if a poll
    /// iteration was already in flight (§4.4).
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn watching_a_directory_emits_create_for_existing_children() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let (watcher, mut rx) = Watcher::new(Duration::from_millis(50));
        watcher.watch(dir.path()).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Created(_)));
    }

    #[tokio::test]
    async fn watching_a_single_file_emits_nothing_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let (watcher, mut rx) = Watcher::new(Duration::from_millis(50));
        watcher.watch(&file).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finish_stops_the_poll_loop_promptly() {
        let (watcher, _rx) = Watcher::new(Duration::from_millis(10));
        let watcher = Arc::new(watcher);
        let runner = Arc::clone(&watcher);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.finish();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("loop should stop within one polling period")
            .unwrap();
    }

    #[tokio::test]
    async fn changed_size_triggers_a_changed_event() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("grows.txt");
        std::fs::write(&file, b"a").unwrap();

        let (watcher, mut rx) = Watcher::new(Duration::from_millis(20));
        watcher.watch(&file).await.unwrap();
        let watcher = Arc::new(watcher);
        let runner = Arc::clone(&watcher);
        tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            f.write_all(b"bbbb").unwrap();
        }

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WatchEvent::Changed(p) if p == file));
        watcher.finish();
    }
}
