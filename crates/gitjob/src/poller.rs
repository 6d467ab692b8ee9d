//! Repository polling.
//!
//! One background task per watched GitJob asks the fetcher for the latest
//! commit on a timer. New commits are written to the GitJob status as a
//! commit event and the GitJob is queued for reconciliation. Poll failures
//! are kept on status as the `GitPolling` condition until a poll succeeds. The watch table
//! is guarded by a single async mutex, so add, modify and remove on the same
//! key never interleave, and a replaced task is fully stopped before its
//! successor starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::controller::WorkQueue;
use crate::credentials::resolve_credential;
use crate::error::{GitJobError, Result};
use crate::event::{record_commit_event, record_polling_result, CommitEvent};
use crate::git::GitFetcher;
use crate::resource::{GitJob, ObjectKey};
use crate::store::ObjectStore;

/// Watch management used by the reconciler.
#[async_trait]
pub trait GitPoller: Send + Sync + 'static {
    /// Starts polling a GitJob, or restarts it if its polling parameters changed.
    async fn add_or_modify_watch(&self, gitjob: &GitJob);

    /// Stops polling. Returns once the polling task has finished.
    async fn remove_watch(&self, key: &ObjectKey);

    /// Stops polling GitJobs that no longer exist.
    async fn clean_up_watches(&self);
}

/// Everything that affects how a source is polled. A change restarts the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchSpec {
    repo: String,
    branch: String,
    revision: String,
    secret_name: String,
    interval: Duration,
    force_update_generation: i64,
}

impl WatchSpec {
    fn from_gitjob(gitjob: &GitJob, default_interval: Duration) -> Self {
        let git = &gitjob.spec.git;
        let interval = gitjob
            .spec
            .polling_interval
            .map(Duration::from_secs)
            .unwrap_or(default_interval)
            // zero periods are rejected by tokio::time::interval
            .max(Duration::from_secs(1));

        Self {
            repo: git.repo.clone(),
            branch: git.branch.clone(),
            revision: git.revision.clone(),
            secret_name: git.credential.client_secret_name.clone(),
            interval,
            force_update_generation: gitjob.spec.force_update_generation,
        }
    }
}

struct Watch {
    spec: WatchSpec,
    handle: JoinHandle<()>,
}

/// Polls every watched GitJob on its own task.
pub struct Poller<S: ObjectStore> {
    store: Arc<S>,
    fetcher: Arc<dyn GitFetcher>,
    queue: WorkQueue,
    default_interval: Duration,
    watches: Mutex<HashMap<ObjectKey, Watch>>,
}

impl<S: ObjectStore> Poller<S> {
    pub fn new(
        store: Arc<S>,
        fetcher: Arc<dyn GitFetcher>,
        queue: WorkQueue,
        default_interval: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            queue,
            default_interval,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Number of active watches.
    pub async fn watch_count(&self) -> usize {
        self.watches.lock().await.len()
    }

    pub async fn is_watching(&self, key: &ObjectKey) -> bool {
        self.watches.lock().await.contains_key(key)
    }

    fn spawn_watch(&self, key: ObjectKey, interval: Duration) -> JoinHandle<()> {
        let task = PollTask {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            queue: self.queue.clone(),
            key,
            last_commit: None,
        };
        tokio::spawn(task.run(interval))
    }
}

async fn stop(watch: Watch) {
    watch.handle.abort();
    // Cancellation is the expected outcome
    let _ = watch.handle.await;
}

#[async_trait]
impl<S: ObjectStore> GitPoller for Poller<S> {
    async fn add_or_modify_watch(&self, gitjob: &GitJob) {
        let key = gitjob.key();
        let mut watches = self.watches.lock().await;

        if gitjob.spec.disable_polling {
            if let Some(watch) = watches.remove(&key) {
                info!(gitjob = %key, "Polling disabled, removing watch");
                stop(watch).await;
            }
            return;
        }

        let spec = WatchSpec::from_gitjob(gitjob, self.default_interval);
        if let Some(existing) = watches.get(&key) {
            if existing.spec == spec {
                return;
            }
        }

        if let Some(old) = watches.remove(&key) {
            debug!(gitjob = %key, "Polling parameters changed, restarting watch");
            stop(old).await;
        } else {
            info!(gitjob = %key, interval_secs = spec.interval.as_secs(), "Adding watch");
        }

        let handle = self.spawn_watch(key.clone(), spec.interval);
        watches.insert(key, Watch { spec, handle });
    }

    async fn remove_watch(&self, key: &ObjectKey) {
        let mut watches = self.watches.lock().await;
        if let Some(watch) = watches.remove(key) {
            info!(gitjob = %key, "Removing watch");
            stop(watch).await;
        }
    }

    async fn clean_up_watches(&self) {
        let keys: Vec<ObjectKey> = self.watches.lock().await.keys().cloned().collect();

        for key in keys {
            match self.store.get::<GitJob>(&key).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => self.remove_watch(&key).await,
                Err(e) => warn!(gitjob = %key, error = %e, "Failed to check watched GitJob"),
            }
        }
    }
}

impl<S: ObjectStore> Drop for Poller<S> {
    fn drop(&mut self) {
        for (_, watch) in self.watches.get_mut().drain() {
            watch.handle.abort();
        }
    }
}

struct PollTask<S: ObjectStore> {
    store: Arc<S>,
    fetcher: Arc<dyn GitFetcher>,
    queue: WorkQueue,
    key: ObjectKey,
    last_commit: Option<String>,
}

impl<S: ObjectStore> PollTask<S> {
    async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let span = info_span!("poll", gitjob = %self.key);
            let error = match self.poll_once().instrument(span).await {
                Ok(()) => None,
                Err(e) if e.is_not_found() => {
                    debug!(gitjob = %self.key, "GitJob is gone, waiting for watch removal");
                    continue;
                }
                Err(e) => {
                    warn!(gitjob = %self.key, error = %e, class = %e.class(), "Polling failed");
                    Some(e)
                }
            };
            self.record_result(error.as_ref()).await;
        }
    }

    /// Updates the polling condition; a change is queued so readiness follows.
    async fn record_result(&self, error: Option<&GitJobError>) {
        match record_polling_result(self.store.as_ref(), &self.key, error).await {
            Ok(true) => self.queue.enqueue(self.key.clone()),
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(gitjob = %self.key, error = %e, "Failed to record polling result"),
        }
    }

    async fn poll_once(&mut self) -> Result<()> {
        let gitjob: GitJob = self.store.get(&self.key).await?;
        let credential = resolve_credential(self.store.as_ref(), &gitjob).await?;
        let commit = self.fetcher.latest_commit(&gitjob, &credential).await?;

        if self.last_commit.as_deref() == Some(commit.as_str())
            || gitjob.status.git_event.commit == commit
        {
            self.last_commit = Some(commit);
            return Ok(());
        }

        let event = CommitEvent::polled(self.key.clone(), commit.clone());
        if record_commit_event(self.store.as_ref(), &event).await? {
            info!(gitjob = %self.key, commit = %commit, "New commit detected");
            self.queue.enqueue(self.key.clone());
        }
        self.last_commit = Some(commit);
        Ok(())
    }
}
