//! Work queue and reconcile loop.
//!
//! Keys are reconciled concurrently across GitJobs but never twice at once
//! for the same GitJob. A key requested while its reconcile is running is
//! marked dirty and run again once the current pass finishes. Store events
//! feed the queue; when some are missed every GitJob is queued again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::event::{record_commit_event, CommitEvent};
use crate::reconciler::{Action, GitJobReconciler};
use crate::resource::{GitJob, ObjectKey, KIND};
use crate::store::{StoreChange, StoreEvent, WatchableStore};

/// Handle for requesting reconciles. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<ObjectKey>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObjectKey>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, key: ObjectKey) {
        if let Err(e) = self.sender.send(key) {
            debug!(gitjob = %e.0, "Work queue closed, dropping request");
        }
    }

    /// Enqueues `key` once `delay` has elapsed.
    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }
}

/// Exponential retry delays for failed reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before the retry following the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

impl From<&ControllerConfig> for Backoff {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_delay_ms),
            max: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    running: bool,
    dirty: bool,
    failures: u32,
}

type Completion = (ObjectKey, Result<Action>);

/// Drives the reconciler from the work queue and store notifications.
pub struct Controller<S: WatchableStore> {
    store: Arc<S>,
    reconciler: Arc<GitJobReconciler<S>>,
    queue: WorkQueue,
    receiver: Mutex<mpsc::UnboundedReceiver<ObjectKey>>,
    events: Mutex<Option<broadcast::Receiver<StoreEvent>>>,
    backoff: Backoff,
}

impl<S: WatchableStore> Controller<S> {
    /// Subscribes to the store right away, so changes made before `run`
    /// starts are not missed.
    pub fn new(
        store: Arc<S>,
        reconciler: GitJobReconciler<S>,
        queue: WorkQueue,
        receiver: mpsc::UnboundedReceiver<ObjectKey>,
        backoff: Backoff,
    ) -> Self {
        let events = store.subscribe();
        Self {
            store,
            reconciler: Arc::new(reconciler),
            queue,
            receiver: Mutex::new(receiver),
            events: Mutex::new(Some(events)),
            backoff,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Records a commit reported by an external trigger, such as a webhook,
    /// and requests a reconcile. Returns whether the status changed.
    pub async fn handle_commit_event(&self, event: CommitEvent) -> Result<bool> {
        let changed = record_commit_event(self.store.as_ref(), &event).await?;
        info!(
            gitjob = %event.key,
            commit = %event.commit,
            event_type = event.event_type.as_deref().unwrap_or_default(),
            changed,
            "Received commit event"
        );
        self.queue.enqueue(event.key);
        Ok(changed)
    }

    /// Processes requests until `shutdown` completes.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) {
        let mut receiver = self.receiver.lock().await;
        let mut events = self.events.lock().await;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut states: HashMap<ObjectKey, KeyState> = HashMap::new();
        tokio::pin!(shutdown);

        info!("Controller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(key) = receiver.recv() => {
                    self.schedule(key, &mut states, &done_tx);
                }
                Some((key, result)) = done_rx.recv() => {
                    self.complete(key, result, &mut states, &done_tx);
                }
                event = next_event(&mut events) => match event {
                    Ok(event) => self.route(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed store events, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => *events = None,
                },
            }
        }
        info!("Controller stopped");
    }

    /// Queues every stored GitJob and drops watches of deleted ones.
    async fn resync(&self) {
        let keys = self.store.keys::<GitJob>().await;
        debug!(count = keys.len(), "Requeueing all GitJobs");
        for key in keys {
            self.queue.enqueue(key);
        }
        self.reconciler.clean_up_watches().await;
    }

    fn schedule(
        &self,
        key: ObjectKey,
        states: &mut HashMap<ObjectKey, KeyState>,
        done: &mpsc::UnboundedSender<Completion>,
    ) {
        let state = states.entry(key.clone()).or_default();
        if state.running {
            state.dirty = true;
            return;
        }
        state.running = true;

        let reconciler = Arc::clone(&self.reconciler);
        let done = done.clone();
        tokio::spawn(async move {
            let span = info_span!("reconcile", gitjob = %key);
            let result = reconciler.reconcile(&key).instrument(span).await;
            // Receiver only goes away on shutdown
            let _ = done.send((key, result));
        });
    }

    fn complete(
        &self,
        key: ObjectKey,
        result: Result<Action>,
        states: &mut HashMap<ObjectKey, KeyState>,
        done: &mpsc::UnboundedSender<Completion>,
    ) {
        let Some(state) = states.get_mut(&key) else {
            return;
        };
        state.running = false;

        match result {
            Ok(Action::AwaitChange) => state.failures = 0,
            Ok(Action::Requeue(delay)) => {
                state.failures = 0;
                self.queue.enqueue_after(key.clone(), delay);
            }
            Err(e) => {
                state.failures += 1;
                let delay = self.backoff.delay(state.failures);
                warn!(
                    gitjob = %key,
                    error = %e,
                    class = %e.class(),
                    failures = state.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed"
                );
                self.queue.enqueue_after(key.clone(), delay);
            }
        }

        if state.dirty {
            state.dirty = false;
            self.schedule(key, states, done);
        } else if state.failures == 0 {
            states.remove(&key);
        }
    }

    /// GitJob writes enqueue the GitJob; Job writes enqueue their owner.
    fn route(&self, event: StoreEvent) {
        match (event.kind.as_str(), event.change) {
            // Written by the reconciler on every pass
            (KIND, StoreChange::StatusUpdated) => {}
            (KIND, _) => self.queue.enqueue(event.key),
            ("Job", _) => {
                if let Some((owner_kind, owner)) = event.owner {
                    if owner_kind == KIND {
                        self.queue.enqueue(owner);
                    }
                }
            }
            _ => {}
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<StoreEvent>>,
) -> std::result::Result<StoreEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
