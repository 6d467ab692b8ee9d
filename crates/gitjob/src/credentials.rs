//! Credential resolution for Git sources.
//!
//! A GitJob only names a secret. The secret's type decides which kind of
//! credential it holds, and the result is a closed set of variants that the
//! job builder and the fetcher both match on.

use k8s_openapi::api::core::v1::Secret;
use secrecy::SecretString;

use crate::error::{GitJobError, Result};
use crate::resource::{GitJob, ObjectKey};
use crate::store::ObjectStore;

pub const SECRET_TYPE_BASIC_AUTH: &str = "kubernetes.io/basic-auth";
pub const SECRET_TYPE_SSH_AUTH: &str = "kubernetes.io/ssh-auth";

pub const BASIC_AUTH_USERNAME_KEY: &str = "username";
pub const BASIC_AUTH_PASSWORD_KEY: &str = "password";
pub const SSH_AUTH_PRIVATE_KEY: &str = "ssh-privatekey";

/// Key of the CA bundle inside the `<name>-cabundle` secret.
pub const CA_BUNDLE_KEY: &str = "ca.crt";

/// Resolved repository credential.
#[derive(Debug, Default)]
pub enum GitCredential {
    #[default]
    None,
    BasicAuth {
        secret_name: String,
        username: String,
        password: SecretString,
    },
    SshKey {
        secret_name: String,
        private_key: SecretString,
    },
}

impl GitCredential {
    /// Name of the secret the credential was read from.
    pub fn secret_name(&self) -> Option<&str> {
        match self {
            GitCredential::None => None,
            GitCredential::BasicAuth { secret_name, .. }
            | GitCredential::SshKey { secret_name, .. } => Some(secret_name),
        }
    }

    /// Builds a credential from a secret, based on the secret's type.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let secret_name = secret.metadata.name.clone().unwrap_or_default();
        let secret_type = secret.type_.as_deref().unwrap_or_default();

        match secret_type {
            SECRET_TYPE_BASIC_AUTH => Ok(GitCredential::BasicAuth {
                username: secret_value(secret, &secret_name, BASIC_AUTH_USERNAME_KEY)?,
                password: SecretString::from(secret_value(
                    secret,
                    &secret_name,
                    BASIC_AUTH_PASSWORD_KEY,
                )?),
                secret_name,
            }),
            SECRET_TYPE_SSH_AUTH => Ok(GitCredential::SshKey {
                private_key: SecretString::from(secret_value(
                    secret,
                    &secret_name,
                    SSH_AUTH_PRIVATE_KEY,
                )?),
                secret_name,
            }),
            other => Err(GitJobError::InvalidCredential {
                secret: secret_name,
                reason: format!(
                    "unsupported secret type '{}', expected '{}' or '{}'",
                    other, SECRET_TYPE_BASIC_AUTH, SECRET_TYPE_SSH_AUTH
                ),
            }),
        }
    }
}

fn secret_value(secret: &Secret, secret_name: &str, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| GitJobError::InvalidCredential {
            secret: secret_name.to_string(),
            reason: format!("missing key '{}'", key),
        })?;

    String::from_utf8(bytes.0.clone()).map_err(|_| GitJobError::InvalidCredential {
        secret: secret_name.to_string(),
        reason: format!("key '{}' is not valid UTF-8", key),
    })
}

/// Reads the credential secret referenced by a GitJob.
///
/// A missing secret is reported as a build error rather than NotFound so that
/// it surfaces on the GitJob status instead of being mistaken for a deleted source.
pub async fn resolve_credential<S: ObjectStore>(store: &S, gitjob: &GitJob) -> Result<GitCredential> {
    let secret_name = &gitjob.spec.git.credential.client_secret_name;
    if secret_name.is_empty() {
        return Ok(GitCredential::None);
    }

    let key = ObjectKey::new(gitjob.namespace(), secret_name.clone());
    match store.get::<Secret>(&key).await {
        Ok(secret) => GitCredential::from_secret(&secret),
        Err(e) if e.is_not_found() => Err(GitJobError::InvalidCredential {
            secret: secret_name.clone(),
            reason: "secret not found".to_string(),
        }),
        Err(e) => Err(e),
    }
}
