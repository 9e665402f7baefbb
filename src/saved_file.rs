//! Per-file upload state machine: at most one upload in flight, rapid
//! re-uploads coalesced, causal order preserved (§4.6).

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::RuncoreResult;

type UploadFuture = Pin<Box<dyn Future<Output = RuncoreResult<()>> + Send>>;
type Uploader = Arc<dyn Fn(PathBuf, String) -> UploadFuture + Send + Sync>;
type OnUploaded = Arc<dyn Fn(&Path) + Send + Sync>;

use std::future::Future;

struct State {
    is_finished: bool,
    is_uploading: bool,
    reupload_scheduled: bool,
    url: Option<String>,
}

/// `Upload(url, headers)` is the only public mutator (§4.6). Construction
/// takes an injected uploader so this module doesn't depend on the
/// concrete transport.
pub struct SavedFile {
    path: PathBuf,
    uploader: Uploader,
    on_uploaded: OnUploaded,
    state: Mutex<State>,
    idle: Notify,
}

impl SavedFile {
    pub fn new(
        path: PathBuf,
        uploader: impl Fn(PathBuf, String) -> UploadFuture + Send + Sync + 'static,
        on_uploaded: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            uploader: Arc::new(uploader),
            on_uploaded: Arc::new(on_uploaded),
            state: Mutex::new(State {
                is_finished: false,
                is_uploading: false,
                reupload_scheduled: false,
                url: None,
            }),
            idle: Notify::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts (or schedules) an upload to `url`. Ignored once [`finish`]
    /// has been called (§4.6).
    ///
    /// [`finish`]: SavedFile::finish
    pub fn upload(self: &Arc<Self>, url: String) {
        let mut state = self.state.lock().unwrap();
        if state.is_finished {
            return;
        }
        if let Some(old) = &state.url {
            if old != &url {
                warn!(old, new = %url, "saved file url changed mid-flight, replacing");
            }
        }
        state.url = Some(url.clone());

        if state.is_uploading {
            state.reupload_scheduled = true;
            return;
        }
        state.is_uploading = true;
        drop(state);
        self.spawn_upload(url);
    }

    fn spawn_upload(self: &Arc<Self>, url: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = (this.uploader)(this.path.clone(), url).await;
            match result {
                Ok(()) => (this.on_uploaded)(&this.path),
                Err(e) => warn!(path = %this.path.display(), error = %e, "upload failed"),
            }

            let next_url = {
                let mut state = this.state.lock().unwrap();
                state.is_uploading = false;
                if state.reupload_scheduled {
                    state.reupload_scheduled = false;
                    state.url.clone()
                } else {
                    None
                }
            };

            match next_url {
                Some(url) => this.spawn_upload(url),
                None => this.idle.notify_waiters(),
            }
        });
    }

    /// Marks the file finished and waits for any in-flight upload and its
    /// trailing re-upload to complete (§4.6).
    pub async fn finish(self: &Arc<Self>) {
        let still_uploading = {
            let mut state = self.state.lock().unwrap();
            state.is_finished = true;
            state.is_uploading
        };
        if still_uploading {
            self.idle.notified().await;
        }
    }
}
