//! Git authentication handling for remote commands.

use std::path::PathBuf;

use secrecy::ExposeSecret;

use crate::credentials::GitCredential;
use crate::error::{GitJobError, Result};
use crate::resource::Credential;

/// Escapes a token for safe use in single-quoted shell strings.
/// Replaces single quotes with '\'' (end quote, escaped quote, start quote).
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// RAII guard for temporary credential files.
///
/// Deletes every registered file when dropped, so passwords, keys and CA
/// bundles are not left on disk even if the git command fails.
#[derive(Debug, Default)]
pub struct TempFileCleanup {
    paths: Vec<PathBuf>,
}

impl TempFileCleanup {
    fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Paths currently owned by the guard.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for TempFileCleanup {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to clean up temporary git file {}: {}", path.display(), e);
            }
        }
    }
}

/// Authentication environment for git commands.
#[derive(Debug)]
pub struct AuthEnv {
    /// Environment variables to set for the git command.
    pub env_vars: Vec<(String, String)>,
    /// Must outlive the git command to keep the temporary files alive.
    pub _cleanup: TempFileCleanup,
}

/// Builds the git environment for a resolved credential and the TLS settings
/// of a source.
pub fn build_auth_env(credential: &GitCredential, tls: &Credential) -> Result<AuthEnv> {
    let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
    let mut cleanup = TempFileCleanup::default();

    match credential {
        GitCredential::None => {}
        GitCredential::BasicAuth {
            username, password, ..
        } => {
            // git asks for the username and the password through the same helper
            let script = format!(
                "#!/bin/sh\ncase \"$1\" in\n  Username*) echo '{}' ;;\n  *) echo '{}' ;;\nesac\n",
                shell_escape_token(username),
                shell_escape_token(password.expose_secret()),
            );
            let path = write_private_file("git-askpass", ".sh", script.as_bytes(), 0o700)?;
            cleanup.push(path.clone());
            env.push(("GIT_ASKPASS".to_string(), path_to_string(&path)?));
        }
        GitCredential::SshKey { private_key, .. } => {
            let mut key = private_key.expose_secret().to_string();
            if !key.ends_with('\n') {
                key.push('\n');
            }
            let path = write_private_file("git-ssh-key", "", key.as_bytes(), 0o600)?;
            cleanup.push(path.clone());

            let display = path_to_string(&path)?;
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    shell_escape_token(&display)
                ),
            ));
        }
    }

    if let Some(bundle) = tls.ca_bundle.as_ref().filter(|b| !b.0.is_empty()) {
        let path = write_private_file("git-ca-bundle", ".crt", &bundle.0, 0o600)?;
        cleanup.push(path.clone());
        env.push(("GIT_SSL_CAINFO".to_string(), path_to_string(&path)?));
    }

    if tls.insecure_skip_tls_verify {
        env.push(("GIT_SSL_NO_VERIFY".to_string(), "true".to_string()));
    }

    Ok(AuthEnv {
        env_vars: env,
        _cleanup: cleanup,
    })
}

fn path_to_string(path: &std::path::Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        GitJobError::GitAuthFailed("Temp directory path contains non-UTF8 characters".to_string())
    })
}

/// Creates a file with a random name in the temp directory, restricted to the
/// owner from the start on Unix.
fn write_private_file(prefix: &str, suffix: &str, contents: &[u8], mode: u32) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(".{}-{}{}", prefix, uuid::Uuid::new_v4(), suffix));

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)?;
        std::io::Write::write_all(&mut file, contents)?;
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        std::fs::write(&path, contents)?;
    }

    Ok(path)
}
