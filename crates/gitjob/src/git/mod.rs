//! Git remote access.

pub mod auth;
pub mod fetcher;
pub mod parse;

use async_trait::async_trait;

use crate::credentials::GitCredential;
use crate::error::Result;
use crate::resource::GitJob;

pub use fetcher::GitCliFetcher;

/// Resolves the latest commit of a source.
///
/// Implementations must be safe to call repeatedly on a timer.
#[async_trait]
pub trait GitFetcher: Send + Sync + 'static {
    async fn latest_commit(&self, gitjob: &GitJob, credential: &GitCredential) -> Result<String>;
}
