//! Error types for the gitjob controller core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while polling, reconciling or loading bundle content.
#[derive(Error, Debug)]
pub enum GitJobError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict updating {kind} '{name}': object has been modified")]
    Conflict { kind: String, name: String },

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Failed to serialize {kind}: {source}")]
    Serialize {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Reference '{reference}' not found in {repo}")]
    GitRefNotFound { repo: String, reference: String },

    #[error("Invalid credential secret '{secret}': {reason}")]
    InvalidCredential { secret: String, reason: String },

    #[error("Invalid CA bundle: {0}")]
    InvalidCaBundle(String),

    #[error("Failed to read directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ignore pattern '{pattern}' in '{path}': {reason}")]
    InvalidPattern {
        path: PathBuf,
        pattern: String,
        reason: String,
    },

    #[error("Failed to read config file '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseConfig(String),

    #[error("Config validation failed: {0}")]
    InvalidConfig(String),

    #[error("File operation failed: {0}")]
    FileOperation(String),
}

impl From<std::io::Error> for GitJobError {
    fn from(err: std::io::Error) -> Self {
        GitJobError::FileOperation(err.to_string())
    }
}

impl From<serde_yaml::Error> for GitJobError {
    fn from(err: serde_yaml::Error) -> Self {
        GitJobError::ParseConfig(err.to_string())
    }
}

/// Coarse error classes, recorded as condition reasons on a GitJob status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    Fetch,
    Build,
    Io,
    Store,
    Config,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::NotFound => "NotFoundError",
            ErrorClass::Conflict => "ConflictError",
            ErrorClass::Fetch => "FetchError",
            ErrorClass::Build => "BuildError",
            ErrorClass::Io => "IOError",
            ErrorClass::Store => "StoreError",
            ErrorClass::Config => "ConfigError",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GitJobError {
    pub fn not_found(kind: impl Into<String>, name: impl std::fmt::Display) -> Self {
        GitJobError::NotFound {
            kind: kind.into(),
            name: name.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            GitJobError::NotFound { .. } => ErrorClass::NotFound,
            GitJobError::AlreadyExists { .. } | GitJobError::Conflict { .. } => {
                ErrorClass::Conflict
            }
            GitJobError::Store(_) | GitJobError::Serialize { .. } => ErrorClass::Store,
            GitJobError::GitOperation(_)
            | GitJobError::GitNetworkError(_)
            | GitJobError::GitTimeout(_)
            | GitJobError::GitAuthFailed(_)
            | GitJobError::GitRefNotFound { .. } => ErrorClass::Fetch,
            GitJobError::InvalidCredential { .. } | GitJobError::InvalidCaBundle(_) => {
                ErrorClass::Build
            }
            GitJobError::ReadDirectory { .. }
            | GitJobError::ReadFile { .. }
            | GitJobError::InvalidPattern { .. }
            | GitJobError::FileOperation(_) => ErrorClass::Io,
            GitJobError::ReadConfig { .. }
            | GitJobError::ParseConfig(_)
            | GitJobError::InvalidConfig(_) => ErrorClass::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GitJobError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, GitJobError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, GitJobError::Conflict { .. })
    }

    /// Returns true if the error is likely transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitJobError::GitNetworkError(_)
                | GitJobError::GitTimeout(_)
                | GitJobError::Conflict { .. }
                | GitJobError::Store(_)
        )
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> GitJobError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return GitJobError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
        || lower.contains("could not read username")
    {
        return GitJobError::GitAuthFailed(stderr.trim().to_string());
    }

    GitJobError::GitOperation(stderr.trim().to_string())
}

/// Result type for gitjob operations.
pub type Result<T> = std::result::Result<T, GitJobError>;
