//! The Snapshot Store (C4): immutable, upsert-on-write serialized aggregate
//! state, keyed by `(stream_id, version, name?)`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::version::Version;

/// Errors surfaced by the Snapshot Store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend reported an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),
}

/// A persisted snapshot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Stream the snapshotted aggregate belongs to (also the partition key,
    /// so snapshots colocate with their events for single-partition reads).
    pub stream_id: String,
    /// The stream version this snapshot was taken at.
    pub version: Version,
    /// Optional discriminator, for multiple named snapshots of one version
    /// (e.g. different read-model projections of the same aggregate state).
    pub name: Option<String>,
    /// Opaque serialized aggregate state.
    pub data: Vec<u8>,
    /// Name of the concrete Rust type the data deserializes into, recorded
    /// for diagnostics and cross-version migration tooling.
    pub data_type_name: String,
    /// When this snapshot was written.
    pub created_at: DateTime<Utc>,
}

fn snapshot_key(stream_id: &str, version: Version, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{stream_id}_{version}_{name}"),
        None => format!("{stream_id}_{version}"),
    }
}

/// The Snapshot Store contract.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Writes `snapshot`, overwriting any existing snapshot with the same
    /// `(stream_id, version, name)`.
    async fn set(&self, snapshot: Snapshot) -> Result<(), Error>;

    /// Loads the snapshot at the exact `(stream_id, version, name)`, if any.
    async fn get(&self, stream_id: &str, version: Version, name: Option<&str>) -> Result<Option<Snapshot>, Error>;

    /// Lists every snapshot recorded for `stream_id`, most recent first.
    async fn list(&self, stream_id: &str) -> Result<Vec<Snapshot>, Error>;

    /// Deletes the snapshot at the exact key, returning whether one existed.
    async fn delete(&self, stream_id: &str, version: Version, name: Option<&str>) -> Result<bool, Error>;

    /// Deletes every snapshot recorded for `stream_id`, returning the count
    /// removed.
    async fn delete_many(&self, stream_id: &str) -> Result<usize, Error>;

    /// Retrieval policy used by [`crate::stream::Handle::fold`]: the highest
    /// unnamed snapshot at or below `current_stream_version`, if any.
    async fn latest_unnamed_up_to(
        &self,
        stream_id: &str,
        current_stream_version: Version,
    ) -> Result<Option<Snapshot>, Error> {
        let mut candidates: Vec<Snapshot> = self
            .list(stream_id)
            .await?
            .into_iter()
            .filter(|s| s.name.is_none() && s.version <= current_stream_version)
            .collect();

        candidates.sort_by_key(|s| s.version);
        Ok(candidates.pop())
    }
}

#[derive(Debug, Default)]
struct Backend {
    snapshots: HashMap<String, Snapshot>,
}

/// In-memory reference implementation of [`SnapshotStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
}

#[async_trait::async_trait]
impl SnapshotStore for InMemory {
    async fn set(&self, snapshot: Snapshot) -> Result<(), Error> {
        let mut backend = self.backend.write().await;
        let key = snapshot_key(&snapshot.stream_id, snapshot.version, snapshot.name.as_deref());
        backend.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn get(&self, stream_id: &str, version: Version, name: Option<&str>) -> Result<Option<Snapshot>, Error> {
        let backend = self.backend.read().await;
        Ok(backend.snapshots.get(&snapshot_key(stream_id, version, name)).cloned())
    }

    async fn list(&self, stream_id: &str) -> Result<Vec<Snapshot>, Error> {
        let backend = self.backend.read().await;
        let mut snapshots: Vec<Snapshot> = backend
            .snapshots
            .values()
            .filter(|s| s.stream_id == stream_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.version);
        Ok(snapshots)
    }

    async fn delete(&self, stream_id: &str, version: Version, name: Option<&str>) -> Result<bool, Error> {
        let mut backend = self.backend.write().await;
        Ok(backend.snapshots.remove(&snapshot_key(stream_id, version, name)).is_some())
    }

    async fn delete_many(&self, stream_id: &str) -> Result<usize, Error> {
        let mut backend = self.backend.write().await;
        let before = backend.snapshots.len();
        backend.snapshots.retain(|_, s| s.stream_id != stream_id);
        Ok(before - backend.snapshots.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn snapshot(stream_id: &str, version: Version) -> Snapshot {
        Snapshot {
            stream_id: stream_id.to_owned(),
            version,
            name: None,
            data: vec![1, 2, 3],
            data_type_name: "Order".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemory::default();
        store.set(snapshot("s1", 9)).await.unwrap();

        let loaded = store.get("s1", 9, None).await.unwrap().expect("snapshot should exist");
        assert_eq!(loaded.version, 9);
    }

    #[tokio::test]
    async fn latest_unnamed_up_to_picks_highest_eligible_version() {
        let store = InMemory::default();
        store.set(snapshot("s1", 9)).await.unwrap();
        store.set(snapshot("s1", 19)).await.unwrap();
        store.set(snapshot("s1", 29)).await.unwrap();

        let latest = store.latest_unnamed_up_to("s1", 24).await.unwrap().expect("should find one");
        assert_eq!(latest.version, 19);
    }

    #[tokio::test]
    async fn delete_many_removes_all_versions_for_stream() {
        let store = InMemory::default();
        store.set(snapshot("s1", 9)).await.unwrap();
        store.set(snapshot("s1", 19)).await.unwrap();
        store.set(snapshot("s2", 9)).await.unwrap();

        let removed = store.delete_many("s1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list("s1").await.unwrap().is_empty());
        assert_eq!(store.list("s2").await.unwrap().len(), 1);
    }
}
