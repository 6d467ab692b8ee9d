//! Commit events and poll results, and how they land on a GitJob status.

use serde::{Deserialize, Serialize};

use crate::error::{GitJobError, Result};
use crate::resource::{ConditionStatus, GitJob, ObjectKey, CONDITION_GIT_POLLING};
use crate::store::ObjectStore;

/// Maximum attempts when a status write races another writer.
const MAX_CONFLICT_RETRIES: u32 = 5;

/// A newly resolved commit for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub key: ObjectKey,
    pub commit: String,
    /// Trigger metadata, e.g. the webhook event type. `None` for polled commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl CommitEvent {
    pub fn polled(key: ObjectKey, commit: impl Into<String>) -> Self {
        Self {
            key,
            commit: commit.into(),
            event_type: None,
        }
    }
}

/// Writes a commit event onto the source's status.
///
/// Returns `Ok(false)` when the status already carries the same commit and
/// event type. Conflicting writes are retried against a freshly read object.
pub async fn record_commit_event<S: ObjectStore>(store: &S, event: &CommitEvent) -> Result<bool> {
    let event_type = event.event_type.clone().unwrap_or_default();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut gitjob: GitJob = store.get(&event.key).await?;
        if gitjob.status.git_event.commit == event.commit
            && gitjob.status.git_event.event_type == event_type
        {
            return Ok(false);
        }

        gitjob.status.git_event.commit = event.commit.clone();
        gitjob.status.git_event.event_type = event_type.clone();

        match store.update_status(&gitjob).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                tracing::debug!(gitjob = %event.key, attempt, "Status conflict, retrying commit event");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Records the outcome of a poll as the `GitPolling` condition.
///
/// A failure sets it to False with the error class as reason. A success flips
/// an existing condition back to True; sources that never failed get no
/// condition. Returns whether the status was written.
pub async fn record_polling_result<S: ObjectStore>(
    store: &S,
    key: &ObjectKey,
    error: Option<&GitJobError>,
) -> Result<bool> {
    let (healthy, reason, message) = match error {
        Some(e) => (false, e.class().as_str(), e.to_string()),
        None => (true, "", String::new()),
    };
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut gitjob: GitJob = store.get(key).await?;
        let unchanged = match gitjob.status.condition(CONDITION_GIT_POLLING) {
            Some(c) => {
                c.status == ConditionStatus::from(healthy)
                    && c.reason == reason
                    && c.message == message
            }
            None => healthy,
        };
        if unchanged {
            return Ok(false);
        }

        gitjob
            .status
            .set_condition(CONDITION_GIT_POLLING, healthy, reason, message.clone());

        match store.update_status(&gitjob).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                tracing::debug!(gitjob = %key, attempt, "Status conflict, retrying polling condition");
            }
            Err(e) => return Err(e),
        }
    }
}
