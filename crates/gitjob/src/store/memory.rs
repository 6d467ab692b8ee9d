//! In-process object store with change notifications.
//!
//! Objects are kept as JSON documents keyed by kind and identity. Writes bump
//! a store-wide resourceVersion and stale writers get a conflict, matching the
//! optimistic concurrency of a Kubernetes API server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{Object, ObjectStore, WatchableStore};
use crate::error::{GitJobError, Result};
use crate::resource::ObjectKey;

/// The type of change applied to a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Created,
    Updated,
    /// Only the status subresource changed.
    StatusUpdated,
    Deleted,
}

/// Event emitted after every successful write.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub change: StoreChange,
    /// Kind and key of the controlling owner, if the object has one.
    pub owner: Option<(String, ObjectKey)>,
}

type Slot = (&'static str, ObjectKey);

/// Events buffered per subscriber. A subscriber that falls further behind
/// sees `RecvError::Lagged` and has to resync.
pub const EVENT_CAPACITY: usize = 256;

/// Object store backed by an in-memory map.
pub struct MemoryStore {
    objects: RwLock<HashMap<Slot, Value>>,
    version: AtomicU64,
    sender: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            sender,
        }
    }

    /// Returns a receiver for change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Removes an object. Deleting a missing object is a NotFound error.
    pub async fn delete<T: Object>(&self, key: &ObjectKey) -> Result<()> {
        let removed = self.objects.write().await.remove(&(T::KIND, key.clone()));
        match removed {
            Some(value) => {
                let owner = serde_json::from_value::<T>(value)
                    .ok()
                    .and_then(|obj| controller_owner(&obj));
                self.notify(T::KIND, key.clone(), StoreChange::Deleted, owner);
                Ok(())
            }
            None => Err(GitJobError::not_found(T::KIND, key)),
        }
    }

    /// Returns the keys of all stored objects of one kind, sorted.
    pub async fn keys<T: Object>(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(kind, _)| *kind == T::KIND)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(
        &self,
        kind: &str,
        key: ObjectKey,
        change: StoreChange,
        owner: Option<(String, ObjectKey)>,
    ) {
        // No subscribers is fine
        let _ = self.sender.send(StoreEvent {
            kind: kind.to_string(),
            key,
            change,
            owner,
        });
    }
}

fn controller_owner<T: Object>(object: &T) -> Option<(String, ObjectKey)> {
    let meta = object.metadata();
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| {
            (
                r.kind.clone(),
                ObjectKey::new(meta.namespace.clone().unwrap_or_default(), r.name.clone()),
            )
        })
}

fn to_value<T: Object>(object: &T) -> Result<Value> {
    serde_json::to_value(object).map_err(|e| GitJobError::Serialize {
        kind: T::KIND.to_string(),
        source: e,
    })
}

fn from_value<T: Object>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| GitJobError::Serialize {
        kind: T::KIND.to_string(),
        source: e,
    })
}

fn stored_version(value: &Value) -> Option<&str> {
    value.get("metadata")?.get("resourceVersion")?.as_str()
}

fn check_version<T: Object>(object: &T, stored: &Value, key: &ObjectKey) -> Result<()> {
    match (&object.metadata().resource_version, stored_version(stored)) {
        (Some(theirs), Some(ours)) if theirs != ours => Err(GitJobError::Conflict {
            kind: T::KIND.to_string(),
            name: key.to_string(),
        }),
        _ => Ok(()),
    }
}

fn set_field(value: &mut Value, field: &str, replacement: Option<Value>) {
    if let Some(map) = value.as_object_mut() {
        match replacement {
            Some(v) => {
                map.insert(field.to_string(), v);
            }
            None => {
                map.remove(field);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<T: Object>(&self, key: &ObjectKey) -> Result<T> {
        let value = self
            .objects
            .read()
            .await
            .get(&(T::KIND, key.clone()))
            .cloned()
            .ok_or_else(|| GitJobError::not_found(T::KIND, key))?;
        from_value(value)
    }

    async fn create<T: Object>(&self, object: &T) -> Result<T> {
        let key = object.key();
        let mut created = object.clone();

        let mut objects = self.objects.write().await;
        let slot = (T::KIND, key.clone());
        if objects.contains_key(&slot) {
            return Err(GitJobError::AlreadyExists {
                kind: T::KIND.to_string(),
                name: key.to_string(),
            });
        }

        let meta = created.metadata_mut();
        meta.resource_version = Some(self.next_version());
        meta.generation = Some(1);
        if meta.uid.is_none() {
            meta.uid = Some(Uuid::new_v4().to_string());
        }

        objects.insert(slot, to_value(&created)?);
        drop(objects);

        self.notify(T::KIND, key, StoreChange::Created, controller_owner(&created));
        Ok(created)
    }

    async fn update<T: Object>(&self, object: &T) -> Result<T> {
        let key = object.key();
        let mut objects = self.objects.write().await;
        let slot = (T::KIND, key.clone());
        let stored = objects
            .get(&slot)
            .ok_or_else(|| GitJobError::not_found(T::KIND, &key))?;
        check_version(object, stored, &key)?;

        let stored_meta: T = from_value(stored.clone())?;
        let mut updated = object.clone();
        let generation = stored_meta.metadata().generation.unwrap_or(1);
        let spec_changed = to_value(object)?.get("spec") != stored.get("spec");

        let meta = updated.metadata_mut();
        meta.resource_version = Some(self.next_version());
        meta.uid = stored_meta.metadata().uid.clone();
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });

        // Status is owned by the status subresource
        let mut value = to_value(&updated)?;
        set_field(&mut value, "status", stored.get("status").cloned());
        let updated: T = from_value(value.clone())?;
        objects.insert(slot, value);
        drop(objects);

        self.notify(T::KIND, key, StoreChange::Updated, controller_owner(&updated));
        Ok(updated)
    }

    async fn update_status<T: Object>(&self, object: &T) -> Result<T> {
        let key = object.key();
        let mut objects = self.objects.write().await;
        let slot = (T::KIND, key.clone());
        let stored = objects
            .get(&slot)
            .ok_or_else(|| GitJobError::not_found(T::KIND, &key))?;
        check_version(object, stored, &key)?;

        let status = to_value(object)?.get("status").cloned();
        if status.as_ref() == stored.get("status") {
            return from_value(stored.clone());
        }

        let mut value = stored.clone();
        set_field(&mut value, "status", status);
        if let Some(meta) = value.get_mut("metadata") {
            set_field(
                meta,
                "resourceVersion",
                Some(Value::String(self.next_version())),
            );
        }

        let updated: T = from_value(value.clone())?;
        objects.insert(slot, value);
        drop(objects);

        self.notify(
            T::KIND,
            key,
            StoreChange::StatusUpdated,
            controller_owner(&updated),
        );
        Ok(updated)
    }
}

#[async_trait]
impl WatchableStore for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        MemoryStore::subscribe(self)
    }

    async fn keys<T: Object>(&self) -> Vec<ObjectKey> {
        MemoryStore::keys::<T>(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================
