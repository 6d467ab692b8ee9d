//! K8s-style resource types for declared Git sources.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

/// The API version for GitJob resources.
pub const API_VERSION: &str = "gitjob.io/v1";

/// The kind name for GitJob resources.
pub const KIND: &str = "GitJob";

/// Default branch polled when a GitJob does not name one.
pub const DEFAULT_BRANCH: &str = "master";

/// Namespaced identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key for an object from its metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A declared Git source and the job that builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitJob {
    /// API version, should always be `gitjob.io/v1`.
    pub api_version: String,

    /// Always `GitJob`.
    pub kind: String,

    pub metadata: ObjectMeta,

    pub spec: GitJobSpec,

    #[serde(default)]
    pub status: GitJobStatus,
}

impl GitJob {
    /// Creates a new GitJob in the given namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: GitJobSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
            status: GitJobStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(&self.metadata)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Name of the secret holding this source's CA bundle.
    pub fn ca_bundle_secret_name(&self) -> String {
        format!("{}-cabundle", self.name())
    }
}

/// GitJob specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitJobSpec {
    /// Repository to watch and clone.
    pub git: GitInfo,

    /// Template for the job run after each clone.
    #[serde(default)]
    pub job_spec: JobSpec,

    /// Poll interval in seconds. Falls back to the controller default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<u64>,

    /// Stops polling entirely; new commits must come from an external trigger.
    #[serde(default)]
    pub disable_polling: bool,

    /// Bumping this value forces a new job even if nothing else changed.
    #[serde(default)]
    pub force_update_generation: i64,
}

/// Repository coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    /// Git repository URL.
    pub repo: String,

    /// Branch to watch.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Pinned revision. When set, it is the commit and the branch is not polled.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,

    #[serde(default)]
    pub credential: Credential,
}

impl Default for GitInfo {
    fn default() -> Self {
        Self {
            repo: String::new(),
            branch: default_branch(),
            revision: String::new(),
            credential: Credential::default(),
        }
    }
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

/// Credential descriptor for a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Secret of type `kubernetes.io/basic-auth` or `kubernetes.io/ssh-auth`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret_name: String,

    /// PEM encoded CA bundle for the git server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<ByteString>,

    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

impl Credential {
    pub fn has_ca_bundle(&self) -> bool {
        self.ca_bundle.as_ref().is_some_and(|b| !b.0.is_empty())
    }
}

/// Observed state of a GitJob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitJobStatus {
    /// The latest commit event seen for this source.
    #[serde(default)]
    pub git_event: GitEvent,

    /// Commit the current job was built for.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_executed_commit: String,

    /// Name of the job built for the current commit.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobPhase>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl GitJobStatus {
    /// Returns the condition of the given type, if recorded.
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Sets a condition, keeping the transition time when only the message
    /// changes. Re-setting identical values leaves the condition untouched.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let status = ConditionStatus::from(status);
        let reason = reason.into();
        let message = message.into();
        let now = Utc::now();

        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.last_update_time = now;
            }
            None => self.conditions.push(Condition {
                condition_type: condition_type.to_string(),
                status,
                reason,
                message,
                last_update_time: now,
                last_transition_time: now,
            }),
        }
    }
}

/// Commit and trigger metadata recorded by the poller or an external trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,

    /// Trigger type, e.g. a webhook event name. Empty for polled commits.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,
}

/// Coarse phase of the build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_STALLED: &str = "Stalled";
/// False while the last poll of the repository failed.
pub const CONDITION_GIT_POLLING: &str = "GitPolling";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================
