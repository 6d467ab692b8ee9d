//! GitJob reconciler: watch → job → status.
//!
//! Every pass reads the GitJob fresh from the store, keeps its watch in sync,
//! makes sure a job exists for the current commit and writes the status back
//! once. Jobs are never modified after creation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::credentials::{resolve_credential, CA_BUNDLE_KEY};
use crate::error::{ErrorClass, GitJobError, Result};
use crate::job::{job_name, owner_reference, JobBuilder, ProxyEnv};
use crate::poller::GitPoller;
use crate::resource::{
    ConditionStatus, GitJob, JobPhase, ObjectKey, CONDITION_GIT_POLLING, CONDITION_READY,
    CONDITION_STALLED,
};
use crate::store::ObjectStore;

/// What the controller should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the GitJob or one of its jobs changes.
    AwaitChange,
    /// Reconcile again after the given delay.
    Requeue(Duration),
}

/// Reconciles GitJobs against their watches and jobs.
pub struct GitJobReconciler<S: ObjectStore> {
    store: Arc<S>,
    poller: Arc<dyn GitPoller>,
    builder: JobBuilder,
    proxy: ProxyEnv,
}

impl<S: ObjectStore> GitJobReconciler<S> {
    pub fn new(
        store: Arc<S>,
        poller: Arc<dyn GitPoller>,
        builder: JobBuilder,
        proxy: ProxyEnv,
    ) -> Self {
        Self {
            store,
            poller,
            builder,
            proxy,
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let mut gitjob: GitJob = match self.store.get(key).await {
            Ok(gitjob) => gitjob,
            Err(e) if e.is_not_found() => {
                debug!(gitjob = %key, "GitJob not found, removing watch");
                self.poller.remove_watch(key).await;
                return Ok(Action::AwaitChange);
            }
            Err(e) => return Err(e),
        };

        self.poller.add_or_modify_watch(&gitjob).await;

        let outcome = self.sync_job(&mut gitjob).await;

        let generation = gitjob.generation();
        let status = &mut gitjob.status;
        status.observed_generation = generation;
        match &outcome {
            Ok(()) => {
                status.set_condition(CONDITION_STALLED, false, "", "");
                // A failing poll keeps the source from being ready
                let polling_error = status
                    .condition(CONDITION_GIT_POLLING)
                    .filter(|c| c.status == ConditionStatus::False)
                    .map(|c| (c.reason.clone(), c.message.clone()));
                match polling_error {
                    Some((reason, message)) => {
                        status.set_condition(CONDITION_READY, false, reason, message)
                    }
                    None => status.set_condition(CONDITION_READY, true, "", ""),
                }
            }
            Err(e) => {
                let class = e.class();
                status.set_condition(
                    CONDITION_STALLED,
                    class == ErrorClass::Build,
                    class.as_str(),
                    e.to_string(),
                );
                status.set_condition(CONDITION_READY, false, class.as_str(), e.to_string());
            }
        }

        let written = self.store.update_status(&gitjob).await;
        if let (Err(_), Err(e)) = (&outcome, &written) {
            warn!(gitjob = %key, error = %e, "Failed to record failed reconcile on status");
        }
        outcome?;
        written?;
        Ok(Action::AwaitChange)
    }

    /// Stops watches whose GitJob is gone.
    pub async fn clean_up_watches(&self) {
        self.poller.clean_up_watches().await;
    }

    async fn sync_job(&self, gitjob: &mut GitJob) -> Result<()> {
        let commit = gitjob.status.git_event.commit.clone();
        if commit.is_empty() {
            debug!(gitjob = %gitjob.key(), "No commit yet, not creating a job");
            return Ok(());
        }

        let name = job_name(gitjob);
        let job_key = ObjectKey::new(gitjob.namespace(), name.clone());

        match self.store.get::<Job>(&job_key).await {
            Ok(job) => {
                gitjob.status.job_status = Some(job_phase(&job));
            }
            Err(e) if e.is_not_found() => {
                let credential = resolve_credential(self.store.as_ref(), gitjob).await?;
                self.ensure_ca_bundle(gitjob).await?;

                let job = self.builder.build(gitjob, &credential, &self.proxy);
                match self.store.create(&job).await {
                    Ok(_) => info!(gitjob = %gitjob.key(), job = %name, commit = %commit, "Created job"),
                    Err(e) if e.is_already_exists() => {
                        debug!(gitjob = %gitjob.key(), job = %name, "Job already created");
                    }
                    Err(e) => return Err(e),
                }
                gitjob.status.job_status = Some(JobPhase::Pending);
            }
            Err(e) => return Err(e),
        }

        gitjob.status.last_executed_commit = commit;
        gitjob.status.job_name = name;
        Ok(())
    }

    /// Creates or refreshes the `<name>-cabundle` secret mounted by the job.
    async fn ensure_ca_bundle(&self, gitjob: &GitJob) -> Result<()> {
        let Some(bundle) = gitjob
            .spec
            .git
            .credential
            .ca_bundle
            .as_ref()
            .filter(|b| !b.0.is_empty())
        else {
            return Ok(());
        };
        validate_ca_bundle(&bundle.0)?;

        let data = BTreeMap::from([(CA_BUNDLE_KEY.to_string(), bundle.clone())]);
        let key = ObjectKey::new(gitjob.namespace(), gitjob.ca_bundle_secret_name());

        match self.store.get::<Secret>(&key).await {
            Ok(mut existing) => {
                if existing.data.as_ref() != Some(&data) {
                    existing.data = Some(data);
                    self.store.update(&existing).await?;
                    debug!(gitjob = %gitjob.key(), secret = %key, "Updated CA bundle secret");
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(key.name.clone()),
                        namespace: Some(key.namespace.clone()),
                        owner_references: owner_reference(gitjob).map(|r| vec![r]),
                        ..Default::default()
                    },
                    data: Some(data),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                match self.store.create(&secret).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_already_exists() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn validate_ca_bundle(bytes: &[u8]) -> Result<()> {
    let pem = std::str::from_utf8(bytes)
        .map_err(|_| GitJobError::InvalidCaBundle("not valid UTF-8".to_string()))?;
    if !pem.contains("-----BEGIN CERTIFICATE-----") {
        return Err(GitJobError::InvalidCaBundle(
            "no PEM certificate found".to_string(),
        ));
    }
    Ok(())
}

/// Coarse phase of a job from its status.
pub fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Pending;
    };

    let has_condition = |kind: &str| {
        status
            .conditions
            .as_ref()
            .is_some_and(|c| c.iter().any(|c| c.type_ == kind && c.status == "True"))
    };

    if has_condition("Complete") || status.succeeded.unwrap_or_default() > 0 {
        JobPhase::Succeeded
    } else if has_condition("Failed") {
        JobPhase::Failed
    } else if status.active.unwrap_or_default() > 0 {
        JobPhase::Running
    } else {
        JobPhase::Pending
    }
}
