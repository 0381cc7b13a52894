//! The Tag Store (C3): a many-to-many secondary index from `tag` to
//! object ids, scoped per `(object_name, tag_type)`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Which family of object a [`TagEntry`] indexes: a document or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagType {
    /// Indexes [`crate::document::ObjectDocument`]s.
    Document,
    /// Indexes event streams directly.
    Stream,
}

/// A single tag-index entry: `(tag_type, object_name, tag, object_id)` is
/// unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Which family this entry indexes.
    pub tag_type: TagType,
    /// Aggregate type tag being indexed.
    pub object_name: String,
    /// The tag value.
    pub tag: String,
    /// The object id this tag resolves to.
    pub object_id: String,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

/// Errors surfaced by the Tag Store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend reported an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),
}

/// The Tag Store contract.
///
/// Partition key is `(object_name, tag)`, so lookup by tag within one object
/// type is a single-partition read.
#[async_trait::async_trait]
pub trait TagStore: Send + Sync {
    /// Records `(tag_type, object_name, tag, object_id)`; a duplicate insert
    /// is a no-op.
    async fn tag(
        &self,
        object_name: &str,
        tag_type: TagType,
        tag: &str,
        object_id: &str,
    ) -> Result<(), Error>;

    /// Removes a single tag entry, if present.
    async fn untag(
        &self,
        object_name: &str,
        tag_type: TagType,
        tag: &str,
        object_id: &str,
    ) -> Result<(), Error>;

    /// Returns every object id tagged with `tag` under `object_name`.
    async fn get_by_tag(
        &self,
        object_name: &str,
        tag_type: TagType,
        tag: &str,
    ) -> Result<Vec<String>, Error>;
}

type Key = (TagType, String, String);

#[derive(Debug, Default)]
struct Backend {
    // keyed by (tag_type, object_name, tag) -> set of object ids, modeling
    // a single-partition `(object_name, tag)` layout.
    index: HashMap<Key, Vec<String>>,
}

/// In-memory reference implementation of [`TagStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
}

#[async_trait::async_trait]
impl TagStore for InMemory {
    async fn tag(&self, object_name: &str, tag_type: TagType, tag: &str, object_id: &str) -> Result<(), Error> {
        let mut backend = self.backend.write().await;
        let key = (tag_type, object_name.to_lowercase(), tag.to_owned());
        let ids = backend.index.entry(key).or_default();

        if !ids.iter().any(|id| id == object_id) {
            ids.push(object_id.to_owned());
        }

        Ok(())
    }

    async fn untag(&self, object_name: &str, tag_type: TagType, tag: &str, object_id: &str) -> Result<(), Error> {
        let mut backend = self.backend.write().await;
        let key = (tag_type, object_name.to_lowercase(), tag.to_owned());

        if let Some(ids) = backend.index.get_mut(&key) {
            ids.retain(|id| id != object_id);
        }

        Ok(())
    }

    async fn get_by_tag(&self, object_name: &str, tag_type: TagType, tag: &str) -> Result<Vec<String>, Error> {
        let backend = self.backend.read().await;
        let key = (tag_type, object_name.to_lowercase(), tag.to_owned());
        Ok(backend.index.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn tag_then_lookup_round_trips() {
        let store = InMemory::default();
        store.tag("order", TagType::Document, "region:eu", "o1").await.unwrap();
        store.tag("order", TagType::Document, "region:eu", "o2").await.unwrap();

        let ids = store.get_by_tag("order", TagType::Document, "region:eu").await.unwrap();
        assert_eq!(ids, vec!["o1".to_string(), "o2".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_tag_is_idempotent() {
        let store = InMemory::default();
        store.tag("order", TagType::Document, "region:eu", "o1").await.unwrap();
        store.tag("order", TagType::Document, "region:eu", "o1").await.unwrap();

        let ids = store.get_by_tag("order", TagType::Document, "region:eu").await.unwrap();
        assert_eq!(ids, vec!["o1".to_string()]);
    }

    #[tokio::test]
    async fn untag_removes_entry() {
        let store = InMemory::default();
        store.tag("order", TagType::Document, "region:eu", "o1").await.unwrap();
        store.untag("order", TagType::Document, "region:eu", "o1").await.unwrap();

        let ids = store.get_by_tag("order", TagType::Document, "region:eu").await.unwrap();
        assert!(ids.is_empty());
    }
}
