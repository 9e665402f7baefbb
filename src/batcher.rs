//! Coalesces bursts of changed-file notifications into batched upload
//! calls (§4.5).

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

struct BatcherState {
    pending: HashSet<PathBuf>,
    timer_armed: bool,
}

/// Coalesces `add` calls landing within `delay` of each other into a
/// single dispatched batch. A `delay` of zero dispatches synchronously
/// (§4.5).
pub struct UploadBatcher<C> {
    delay: Duration,
    state: Arc<Mutex<BatcherState>>,
    callback: Arc<C>,
    idle: Arc<Notify>,
}

impl<C, Fut> UploadBatcher<C>
where
    C: Fn(Vec<PathBuf>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(delay: Duration, callback: C) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(BatcherState {
                pending: HashSet::new(),
                timer_armed: false,
            })),
            callback: Arc::new(callback),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Add paths to the current (or next) batch. With a zero delay this
    /// dispatches immediately and returns only once the callback has.
    pub async fn add(&self, paths: impl IntoIterator<Item = PathBuf>) {
        if self.delay.is_zero() {
            let batch: Vec<PathBuf> = paths.into_iter().collect();
            if !batch.is_empty() {
                (self.callback)(batch).await;
            }
            return;
        }

        let should_arm = {
            let mut state = self.state.lock().unwrap();
            state.pending.extend(paths);
            if state.timer_armed {
                false
            } else {
                state.timer_armed = true;
                true
            }
        };

        if should_arm {
            let state = Arc::clone(&self.state);
            let callback = Arc::clone(&self.callback);
            let idle = Arc::clone(&self.idle);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let batch: Vec<PathBuf> = {
                    let mut state = state.lock().unwrap();
                    state.timer_armed = false;
                    state.pending.drain().collect()
                };
                if !batch.is_empty() {
                    callback(batch).await;
                }
                idle.notify_waiters();
            });
        }
    }

    /// Block until every coalesced batch armed so far has been dispatched
    /// and its callback has returned (§4.5).
    pub async fn wait(&self) {
        loop {
            let idle = {
                let state = self.state.lock().unwrap();
                !state.timer_armed && state.pending.is_empty()
            };
            if idle {
                return;
            }
            self.idle.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn zero_delay_dispatches_synchronously() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let batcher = UploadBatcher::new(Duration::ZERO, move |_paths| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });
        batcher.add(vec![PathBuf::from("a")]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_adds_within_delay_coalesce_into_one_batch() {
        let batches = Arc::new(Mutex::new(Vec::<Vec<PathBuf>>::new()));
        let recorded = Arc::clone(&batches);
        let batcher = UploadBatcher::new(Duration::from_millis(30), move |paths| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(paths);
            }
        });

        batcher.add(vec![PathBuf::from("a")]).await;
        batcher.add(vec![PathBuf::from("b")]).await;
        batcher.wait().await;

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }
}
