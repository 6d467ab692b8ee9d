//! GitOps synchronization core.
//!
//! This crate watches declared Git sources and turns new commits into build jobs:
//! - Per-source polling tasks that detect new commits
//! - A reconciler that keeps one build job per commit and records status
//! - A pure job builder wiring credentials, CA bundles and proxies into the job
//! - A content loader that reads checked-out trees honoring `.fleetignore` files

pub mod bundlereader;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod event;
pub mod git;
pub mod job;
pub mod logging;
pub mod poller;
pub mod reconciler;
pub mod resource;
pub mod store;

pub use bundlereader::{load_content, IgnoreRuleSet};
pub use config::{ControllerConfig, LogConfig, LogFormat};
pub use controller::{Backoff, Controller, WorkQueue};
pub use credentials::{resolve_credential, GitCredential};
pub use error::{ErrorClass, GitJobError, Result};
pub use event::{record_commit_event, CommitEvent};
pub use git::{GitCliFetcher, GitFetcher};
pub use job::{job_name, JobBuilder, ProxyEnv};
pub use logging::init_logging;
pub use poller::{GitPoller, Poller};
pub use reconciler::{Action, GitJobReconciler};
pub use resource::{
    Credential, GitEvent, GitInfo, GitJob, GitJobSpec, GitJobStatus, JobPhase, ObjectKey,
    API_VERSION, KIND,
};
pub use store::{MemoryStore, Object, ObjectStore, StoreChange, StoreEvent, WatchableStore};
