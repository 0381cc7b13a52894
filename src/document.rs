//! The Document Store (C2): per-aggregate metadata -- the active stream
//! pointer, terminated-stream history, and the hash chain used for
//! optimistic concurrency on document writes.

pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::tag::{self, TagStore};
use crate::version::Version;

/// Errors surfaced by the Document Store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `set` was called with a `prev_hash` that does not match the document's
    /// stored `hash` -- another writer updated the document concurrently.
    #[error("document concurrency conflict: expected hash {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Hash the caller believed was current.
        expected: String,
        /// Hash actually stored.
        actual: String,
    },

    /// `create` was called for an `(object_name, object_id)` pair that
    /// already has a document.
    #[error("document already exists for {object_name}/{object_id}")]
    AlreadyExists {
        /// The aggregate type tag.
        object_name: String,
        /// The aggregate instance id.
        object_id: String,
    },

    /// The backend reported an error outside the conflict taxonomy.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),

    /// The [`TagStore`] lookup used by `get_first_by_tag`/`get_by_tag` failed.
    #[error(transparent)]
    Tag(#[from] tag::Error),
}

/// Routing names for the backend families a stream (or its associated
/// document/tags/snapshots) is stored in; `None` defers to
/// [`crate::config::EngineConfig`]'s defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRouting {
    /// Data store backend name, or `None` for the configured default.
    pub data_store: Option<String>,
    /// Document store backend name, or `None` for the configured default.
    pub document_store: Option<String>,
    /// Document-tag store backend name, or `None` for the configured default.
    pub document_tag_store: Option<String>,
    /// Stream-tag store backend name, or `None` for the configured default.
    pub stream_tag_store: Option<String>,
    /// Snapshot store backend name, or `None` for the configured default.
    pub snapshot_store: Option<String>,
}

/// Optional chunk-boundary metadata for a stream, gated behind the
/// `chunking` feature.
#[cfg(feature = "chunking")]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Index of the chunk currently accepting writes.
    pub active_chunk: u32,
    /// Version at which the active chunk begins.
    pub chunk_start_version: Version,
}

/// Per-stream metadata carried by an [`ObjectDocument`]'s `active` pointer,
/// and by each entry in `terminated_streams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInformation {
    /// Unique identifier of the stream.
    pub stream_identifier: String,
    /// Backend tag describing the stream's physical kind.
    pub stream_type: String,
    /// Last committed version, or `-1` if the stream has never been
    /// written to.
    pub current_stream_version: i64,
    /// Backend routing overrides for this stream.
    pub routing: BackendRouting,
    /// Chunk-boundary metadata, present only when the `chunking` feature is
    /// enabled.
    #[cfg(feature = "chunking")]
    pub chunk_info: Option<ChunkInfo>,
}

impl StreamInformation {
    /// Builds a fresh, empty [`StreamInformation`] for a brand-new stream.
    pub fn new(stream_identifier: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            stream_identifier: stream_identifier.into(),
            stream_type: stream_type.into(),
            current_stream_version: -1,
            routing: BackendRouting::default(),
            #[cfg(feature = "chunking")]
            chunk_info: None,
        }
    }
}

/// A previously-active stream that has since been closed via live migration
/// or another termination reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatedStream {
    /// The stream information as it stood at termination.
    pub stream: StreamInformation,
    /// Last business-event version recorded before termination.
    pub stream_version: Version,
    /// Human-readable termination reason.
    pub reason: String,
    /// Identifier of the stream that continues this one's history, if any.
    pub continuation_stream_id: Option<String>,
    /// Wall-clock time of termination.
    pub terminated_at: DateTime<Utc>,
}

/// Per-aggregate-instance metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDocument {
    /// Lowercase type tag of the aggregate (e.g. `"order"`).
    pub object_name: String,
    /// Aggregate instance identifier.
    pub object_id: String,
    /// The currently-active stream.
    pub active: StreamInformation,
    /// Closed predecessor streams, oldest first.
    pub terminated_streams: Vec<TerminatedStream>,
    /// Schema version of this document shape, for document evolution.
    pub schema_version: u32,
    /// Hash of the current `active` pointer's identifying fields.
    pub hash: String,
    /// Hash stored before the most recent successful write, i.e. the value
    /// that was `hash` just prior to this document's last `set`.
    pub prev_hash: String,
}

impl ObjectDocument {
    /// Creates a brand-new document for `(object_name, object_id)`, with a
    /// freshly-minted active stream identifier.
    pub fn new(object_name: impl Into<String>, object_id: impl Into<String>, stream_type: impl Into<String>) -> Self {
        let object_name = object_name.into().to_lowercase();
        let object_id = object_id.into();
        let stream_identifier = format!("{object_name}-{object_id}");
        let active = StreamInformation::new(stream_identifier, stream_type);
        let hash = compute_hash(&active);

        Self {
            object_name,
            object_id,
            active,
            terminated_streams: Vec::new(),
            schema_version: 1,
            hash,
            prev_hash: String::new(),
        }
    }

    /// Recomputes `hash`/`prev_hash` after `active` has been mutated, ready
    /// for the next [`DocumentStore::set`] call.
    pub fn rehash(&mut self) {
        let new_hash = compute_hash(&self.active);
        self.prev_hash = std::mem::replace(&mut self.hash, new_hash);
    }
}

/// Computes the deterministic hash over a stream's identifying fields.
fn compute_hash(stream: &StreamInformation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stream.stream_identifier.as_bytes());
    hasher.update(stream.stream_type.as_bytes());
    hasher.update(stream.current_stream_version.to_be_bytes());
    hasher.update(stream.routing.data_store.as_deref().unwrap_or("").as_bytes());
    hasher.update(stream.routing.document_store.as_deref().unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The Document Store contract.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a brand-new document; fails with [`Error::AlreadyExists`] if
    /// one is already present.
    async fn create(&self, document: ObjectDocument) -> Result<(), Error>;

    /// Loads a document by its natural key, or `None` if absent.
    async fn get(&self, object_name: &str, object_id: &str) -> Result<Option<ObjectDocument>, Error>;

    /// Resolves `tag` to its object ids via the [`TagStore`] and returns the
    /// first matching document, or `None`.
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag_type: tag::TagType,
        tag: &str,
        tags: &dyn TagStore,
    ) -> Result<Option<ObjectDocument>, Error> {
        let ids = tags.get_by_tag(object_name, tag_type, tag).await?;
        for id in ids {
            if let Some(doc) = self.get(object_name, &id).await? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    /// Resolves `tag` to its object ids via the [`TagStore`] and batch-loads
    /// every matching document.
    async fn get_by_tag(
        &self,
        object_name: &str,
        tag_type: tag::TagType,
        tag: &str,
        tags: &dyn TagStore,
    ) -> Result<Vec<ObjectDocument>, Error> {
        let ids = tags.get_by_tag(object_name, tag_type, tag).await?;
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get(object_name, &id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Writes `document` under optimistic concurrency: the call fails with
    /// [`Error::ConcurrencyConflict`] unless the stored `hash` equals
    /// `document.prev_hash`. When `use_optimistic_concurrency` is `false`
    /// this degrades to an unconditional upsert.
    async fn set(&self, document: ObjectDocument, use_optimistic_concurrency: bool) -> Result<(), Error>;
}

#[derive(Debug, Default)]
struct Backend {
    documents: HashMap<(String, String), ObjectDocument>,
}

/// In-memory reference implementation of [`DocumentStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
    observer: Option<provider::InMemory>,
}

impl InMemory {
    /// Builds a document store that mirrors every `create`/`set` into
    /// `provider`, keeping a [`provider::ObjectIdProvider`] in sync without
    /// requiring callers to invoke [`provider::InMemory::observe`] by hand.
    pub fn with_provider(provider: provider::InMemory) -> Self {
        Self {
            backend: Arc::default(),
            observer: Some(provider),
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemory {
    async fn create(&self, document: ObjectDocument) -> Result<(), Error> {
        let key = (document.object_name.clone(), document.object_id.clone());
        {
            let mut backend = self.backend.write().await;
            if backend.documents.contains_key(&key) {
                return Err(Error::AlreadyExists {
                    object_name: key.0,
                    object_id: key.1,
                });
            }
            backend.documents.insert(key, document.clone());
        }

        if let Some(observer) = &self.observer {
            observer.observe(document).await;
        }
        Ok(())
    }

    async fn get(&self, object_name: &str, object_id: &str) -> Result<Option<ObjectDocument>, Error> {
        let backend = self.backend.read().await;
        Ok(backend
            .documents
            .get(&(object_name.to_lowercase(), object_id.to_owned()))
            .cloned())
    }

    async fn set(&self, document: ObjectDocument, use_optimistic_concurrency: bool) -> Result<(), Error> {
        let key = (document.object_name.clone(), document.object_id.clone());
        {
            let mut backend = self.backend.write().await;
            if use_optimistic_concurrency {
                if let Some(existing) = backend.documents.get(&key) {
                    if existing.hash != document.prev_hash {
                        return Err(Error::ConcurrencyConflict {
                            expected: document.prev_hash,
                            actual: existing.hash.clone(),
                        });
                    }
                }
            }
            backend.documents.insert(key, document.clone());
        }

        if let Some(observer) = &self.observer {
            observer.observe(document).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemory::default();
        let doc = ObjectDocument::new("order", "o1", "order-stream");

        store.create(doc.clone()).await.expect("create should succeed");

        let loaded = store.get("order", "o1").await.unwrap().expect("document should exist");
        assert_eq!(loaded, doc);
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = InMemory::default();
        let doc = ObjectDocument::new("order", "o1", "order-stream");

        store.create(doc.clone()).await.unwrap();
        let err = store.create(doc).await.expect_err("second create should fail");
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn set_detects_concurrency_conflict() {
        let store = InMemory::default();
        let mut doc = ObjectDocument::new("order", "o1", "order-stream");
        store.create(doc.clone()).await.unwrap();

        doc.active.current_stream_version = 0;
        doc.rehash();
        store.set(doc.clone(), true).await.expect("first update should succeed");

        // Stale prev_hash: caller still has the pre-update hash.
        let mut stale = doc.clone();
        stale.active.current_stream_version = 1;
        stale.prev_hash = "stale".into();

        let err = store.set(stale, true).await.expect_err("stale write should conflict");
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn set_without_optimistic_concurrency_is_unconditional() {
        let store = InMemory::default();
        let doc = ObjectDocument::new("order", "o1", "order-stream");
        store.create(doc.clone()).await.unwrap();

        let mut stale = doc;
        stale.prev_hash = "whatever".into();
        store.set(stale, false).await.expect("unconditional upsert should succeed");
    }

    #[tokio::test]
    async fn with_provider_keeps_the_object_id_provider_in_sync() {
        use provider::ObjectIdProvider;

        let id_provider = provider::InMemory::new();
        let store = InMemory::with_provider(id_provider.clone());

        let mut doc = ObjectDocument::new("order", "o1", "order-stream");
        store.create(doc.clone()).await.unwrap();
        assert!(id_provider.exists("order", "o1").await.unwrap());

        doc.active.current_stream_version = 0;
        doc.rehash();
        store.set(doc, true).await.unwrap();
        assert_eq!(id_provider.count("order").await.unwrap(), 1);
    }
}
