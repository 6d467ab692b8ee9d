//! Object store seam.
//!
//! Reconciles never list or query: they read objects by identity and write
//! them back. Listing keys is reserved for resyncing after missed events. Status is written through a separate subresource call so
//! that spec and status writers do not clobber each other.

pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::resource::{GitJob, ObjectKey};

pub use memory::{MemoryStore, StoreChange, StoreEvent, EVENT_CAPACITY};

/// A typed object that can be kept in an [`ObjectStore`].
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(self.metadata())
    }
}

impl Object for GitJob {
    const KIND: &'static str = crate::resource::KIND;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Object for Job {
    const KIND: &'static str = "Job";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Object for Secret {
    const KIND: &'static str = "Secret";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Get-by-identity and write-back operations on typed objects.
///
/// `get` fails with [`GitJobError::NotFound`](crate::GitJobError::NotFound) for
/// missing objects. `create` fails with `AlreadyExists`, and `update` /
/// `update_status` fail with `Conflict` when the caller's resourceVersion is stale.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<T: Object>(&self, key: &ObjectKey) -> Result<T>;

    async fn create<T: Object>(&self, object: &T) -> Result<T>;

    async fn update<T: Object>(&self, object: &T) -> Result<T>;

    async fn update_status<T: Object>(&self, object: &T) -> Result<T>;
}

/// A store that publishes change events and can enumerate what it holds.
///
/// Events may be dropped for a slow subscriber; the subscriber then lists the
/// keys it cares about and resyncs from those.
#[async_trait]
pub trait WatchableStore: ObjectStore {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Keys of all stored objects of one kind.
    async fn keys<T: Object>(&self) -> Vec<ObjectKey>;
}
