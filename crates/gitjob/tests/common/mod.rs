//! Shared helpers for gitjob integration tests.
//!
//! `Harness` wires a memory store, a scripted fetcher, the poller, the
//! reconciler and a running controller together.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gitjob::{
    Backoff, Controller, GitCredential, GitFetcher, GitJob, GitJobReconciler, GitJobSpec,
    JobBuilder, MemoryStore, ObjectStore, Poller, ProxyEnv, Result, WorkQueue,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Fetcher returning whatever commit the test last set.
#[derive(Default)]
pub struct ScriptedFetcher {
    commit: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn set_commit(&self, commit: &str) {
        *self.commit.lock().unwrap() = commit.to_string();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitFetcher for ScriptedFetcher {
    async fn latest_commit(&self, _: &GitJob, _: &GitCredential) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.commit.lock().unwrap().clone())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub poller: Arc<Poller<MemoryStore>>,
    pub controller: Arc<Controller<MemoryStore>>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Harness {
    pub fn start(commit: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.set_commit(commit);

        let (queue, receiver) = WorkQueue::new();
        let poller = Arc::new(Poller::new(
            Arc::clone(&store),
            fetcher.clone(),
            queue.clone(),
            Duration::from_secs(15),
        ));
        let reconciler = GitJobReconciler::new(
            Arc::clone(&store),
            poller.clone(),
            JobBuilder::new("rancher/fleet:test"),
            ProxyEnv::default(),
        );
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        let controller = Arc::new(Controller::new(
            Arc::clone(&store),
            reconciler,
            queue,
            receiver,
            backoff,
        ));

        let (shutdown, stopped) = oneshot::channel::<()>();
        let running = Arc::clone(&controller);
        let handle = tokio::spawn(async move {
            running
                .run(async {
                    let _ = stopped.await;
                })
                .await;
        });

        Self {
            store,
            fetcher,
            poller,
            controller,
            shutdown,
            handle,
        }
    }

    pub async fn create_gitjob(&self, name: &str, spec: GitJobSpec) -> GitJob {
        self.store
            .create(&GitJob::new("default", name, spec))
            .await
            .expect("create gitjob")
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.expect("controller task panicked");
    }
}

pub fn repo_spec() -> GitJobSpec {
    let mut spec = GitJobSpec::default();
    spec.git.repo = "https://github.com/rancher/fleet-examples".to_string();
    spec
}

/// Polls `check` until it returns true, advancing (paused) time between tries.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}
