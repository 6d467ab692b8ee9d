//! `git ls-remote` based commit lookup.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use super::auth::build_auth_env;
use super::parse::{format_git_error, parse_ls_remote};
use super::GitFetcher;
use crate::credentials::GitCredential;
use crate::error::{classify_git_error, GitJobError, Result};
use crate::resource::GitJob;

/// Resolves branch heads by shelling out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCliFetcher {
    timeout: Duration,
}

impl GitCliFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl GitFetcher for GitCliFetcher {
    async fn latest_commit(&self, gitjob: &GitJob, credential: &GitCredential) -> Result<String> {
        let git = &gitjob.spec.git;
        if !git.revision.is_empty() {
            return Ok(git.revision.clone());
        }

        let reference = format!("refs/heads/{}", git.branch);
        let auth = build_auth_env(credential, &git.credential)?;

        let mut cmd = TokioCommand::new("git");
        cmd.args(["ls-remote", &git.repo, &reference])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &auth.env_vars {
            cmd.env(key, value);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| GitJobError::GitOperation(e.to_string()))?,
            Err(_) => return Err(GitJobError::GitTimeout(self.timeout.as_secs())),
        };

        // Drop auth env (cleanup guard) after command completes
        drop(auth);

        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ls_remote(&stdout, &reference).ok_or_else(|| GitJobError::GitRefNotFound {
            repo: git.repo.clone(),
            reference,
        })
    }
}
