//! Deletions held back for an undo window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

/// How long a confirmed delete can still be undone.
pub const DELETE_GRACE: Duration = Duration::from_secs(15);

type DeleteKey = (i64, String);

/// Delete jobs waiting out their grace period, keyed by chat and slug.
///
/// Whoever removes the entry first wins: the timer runs the job, `undo`
/// aborts it.
#[derive(Default, Clone)]
pub struct PendingDeletes {
    jobs: Arc<Mutex<HashMap<DeleteKey, (u64, AbortHandle)>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingDeletes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` once `grace` has passed unless it is undone first.
    ///
    /// Returns `false` without scheduling when a delete of the same post is
    /// already waiting in this chat.
    pub async fn schedule<F>(&self, chat_id: i64, slug: &str, grace: Duration, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (chat_id, slug.to_string());
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&key) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.jobs);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let due = {
                let mut jobs = registry.lock().await;
                match jobs.get(&task_key) {
                    Some((current, _)) if *current == id => {
                        jobs.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if due {
                debug!(chat_id = task_key.0, slug = %task_key.1, "Grace period over; deleting");
                job.await;
            }
        });

        jobs.insert(key, (id, handle.abort_handle()));
        debug!(chat_id, slug, grace_ms = grace.as_millis() as u64, "Delete scheduled");
        true
    }

    /// Cancel a waiting delete. `false` if it already ran or never existed.
    pub async fn undo(&self, chat_id: i64, slug: &str) -> bool {
        let removed = self.jobs.lock().await.remove(&(chat_id, slug.to_string()));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                debug!(chat_id, slug, "Delete undone");
                true
            }
            None => false,
        }
    }

    pub async fn is_pending(&self, chat_id: i64, slug: &str) -> bool {
        self.jobs
            .lock()
            .await
            .contains_key(&(chat_id, slug.to_string()))
    }
}
