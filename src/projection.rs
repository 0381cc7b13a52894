//! The Projection Runtime (C7): read models folded from one or more event
//! streams, with per-stream checkpoints so a resumed projection never
//! re-applies an event it has already seen.
//!
//! Generalized from a single stream to many (a projection's checkpoint is
//! keyed per `stream_id`) and given a schema fingerprint so a redeployed
//! binary with a changed set of handled event types is detected rather than
//! silently corrupting state.

pub mod routed;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::codec::Codec;
use crate::event::StoredEvent;
use crate::message::Message;
use crate::version::Version;

/// Errors surfaced by the Projection Runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No projection state exists for `(type_name, id)`.
    #[error("projection not found")]
    NotFound,

    /// A stored event's payload could not be decoded.
    #[error("failed to decode event payload")]
    Decode,

    /// The persisted record's `checkpoint_fingerprint` no longer matches this
    /// build's handled event types; the caller must rebuild from scratch.
    #[error("projection schema fingerprint mismatch, rebuild required")]
    FingerprintMismatch,

    /// The persisted record's JSON state failed to deserialize into the
    /// requested projection type.
    #[error("failed to deserialize projection state")]
    CorruptState,

    /// The backend reported an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),
}

/// A read model folded incrementally from one or more event streams.
pub trait Projection: Default + Serialize + DeserializeOwned + Send + Sync {
    /// The domain event type this projection handles.
    type Event: Message + Send + Sync;

    /// The logical name this projection is persisted and looked up under.
    fn type_name() -> &'static str;

    /// Every event type name this projection's `apply` understands, used to
    /// compute [`ProjectionRecord::checkpoint_fingerprint`]. Declaring this
    /// list explicitly (rather than deriving it from a match arm count) is
    /// what lets a redeploy that adds or removes a handled event type force
    /// a rebuild instead of silently skipping events.
    fn handled_event_types() -> &'static [&'static str];

    /// Folds `event`, sourced from `stream_id`, onto `self`. Called once per
    /// event, strictly in the order each stream delivered them; events from
    /// different streams may interleave.
    fn apply(&mut self, stream_id: &str, event: Self::Event);
}

fn fingerprint(event_types: &[&'static str]) -> String {
    let mut sorted = event_types.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for name in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// The persisted shape of a projection: its serialized state plus the
/// bookkeeping needed to resume folding safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    /// [`Projection::type_name`] of the projection this record belongs to.
    pub type_name: String,
    /// Instance id, distinguishing multiple projections of the same type
    /// (e.g. one per tenant); singleton projections use a fixed id.
    pub id: String,
    /// Opaque JSON-serialized projection state.
    pub data: Vec<u8>,
    /// Last-applied [`Version`] per source stream, so a resumed fold skips
    /// events it has already applied.
    pub checkpoint: HashMap<String, Version>,
    /// See [`fingerprint`]; a mismatch means the handler set has drifted
    /// since this record was last written.
    pub checkpoint_fingerprint: String,
    /// Last time this record was written.
    pub updated_at: DateTime<Utc>,
}

/// The storage contract for [`ProjectionRecord`]s.
#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Loads the record for `(type_name, id)`, if any.
    async fn load(&self, type_name: &str, id: &str) -> Result<Option<ProjectionRecord>, Error>;

    /// Writes `record`, overwriting any prior state for the same key.
    async fn save(&self, record: ProjectionRecord) -> Result<(), Error>;

    /// Deletes the record for `(type_name, id)`, returning whether one
    /// existed.
    async fn delete(&self, type_name: &str, id: &str) -> Result<bool, Error>;

    /// Returns `true` if a record exists for `(type_name, id)`.
    async fn exists(&self, type_name: &str, id: &str) -> Result<bool, Error> {
        Ok(self.load(type_name, id).await?.is_some())
    }
}

#[derive(Debug, Default)]
struct Backend {
    records: HashMap<(String, String), ProjectionRecord>,
}

/// In-memory reference implementation of [`ProjectionStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
}

#[async_trait::async_trait]
impl ProjectionStore for InMemory {
    async fn load(&self, type_name: &str, id: &str) -> Result<Option<ProjectionRecord>, Error> {
        let backend = self.backend.read().await;
        Ok(backend.records.get(&(type_name.to_owned(), id.to_owned())).cloned())
    }

    async fn save(&self, record: ProjectionRecord) -> Result<(), Error> {
        let mut backend = self.backend.write().await;
        backend
            .records
            .insert((record.type_name.clone(), record.id.clone()), record);
        Ok(())
    }

    async fn delete(&self, type_name: &str, id: &str) -> Result<bool, Error> {
        let mut backend = self.backend.write().await;
        Ok(backend.records.remove(&(type_name.to_owned(), id.to_owned())).is_some())
    }
}

/// Ties a [`Projection`] type to a [`ProjectionStore`], providing the
/// `getOrCreate`/`save`/`exists`/`getLastModified`/`delete` surface and a
/// checkpointed `fold`.
pub struct Factory<P, S, C> {
    store: S,
    codec: C,
    _projection: std::marker::PhantomData<P>,
}

impl<P, S, C> Factory<P, S, C>
where
    P: Projection,
    S: ProjectionStore,
    C: Codec<P::Event>,
{
    /// Builds a [`Factory`] for projection type `P`.
    pub fn new(store: S, codec: C) -> Self {
        Self {
            store,
            codec,
            _projection: std::marker::PhantomData,
        }
    }

    /// The codec this factory decodes [`Projection::Event`]s with; exposed
    /// for callers (such as [`crate::projection::routed::Entry`]) that need
    /// to attempt a decode without running a full `fold`.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Loads the current record for `id`, or a fresh `P::default()` with an
    /// empty checkpoint if none exists yet.
    pub async fn get_or_create(&self, id: &str) -> Result<(P, ProjectionRecord), Error> {
        match self.store.load(P::type_name(), id).await? {
            Some(record) => {
                if record.checkpoint_fingerprint != fingerprint(P::handled_event_types()) {
                    return Err(Error::FingerprintMismatch);
                }
                let state: P = serde_json::from_slice(&record.data).map_err(|_| Error::CorruptState)?;
                Ok((state, record))
            }
            None => {
                let record = ProjectionRecord {
                    type_name: P::type_name().to_owned(),
                    id: id.to_owned(),
                    data: serde_json::to_vec(&P::default()).expect("default projection state serializes"),
                    checkpoint: HashMap::new(),
                    checkpoint_fingerprint: fingerprint(P::handled_event_types()),
                    updated_at: Utc::now(),
                };
                Ok((P::default(), record))
            }
        }
    }

    /// Folds `events` (all sourced from `stream_id`) onto `state`, skipping
    /// any whose version is not newer than the record's checkpoint for that
    /// stream (idempotent resumption).
    pub fn fold(&self, state: &mut P, record: &mut ProjectionRecord, stream_id: &str, events: &[StoredEvent]) -> Result<(), Error> {
        let checkpoint = record.checkpoint.get(stream_id).copied();

        for stored in events {
            if stored.is_close_sentinel() {
                continue;
            }
            if checkpoint.is_some_and(|last| stored.version <= last) {
                continue;
            }

            let event: P::Event = self
                .codec
                .deserialize(stored.payload.clone())
                .map_err(|_| Error::Decode)?;

            state.apply(stream_id, event);
            record.checkpoint.insert(stream_id.to_owned(), stored.version);
        }

        Ok(())
    }

    /// Persists `state`/`record` after a `fold`, stamping `updated_at` and
    /// the current fingerprint.
    pub async fn save(&self, state: &P, mut record: ProjectionRecord) -> Result<(), Error> {
        record.data = serde_json::to_vec(state).expect("projection state serializes to JSON");
        record.checkpoint_fingerprint = fingerprint(P::handled_event_types());
        record.updated_at = Utc::now();
        self.store.save(record).await
    }

    /// Returns `true` if a record exists for `id`.
    pub async fn exists(&self, id: &str) -> Result<bool, Error> {
        self.store.exists(P::type_name(), id).await
    }

    /// Returns the last-write timestamp for `id`, if a record exists.
    pub async fn get_last_modified(&self, id: &str) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.store.load(P::type_name(), id).await?.map(|r| r.updated_at))
    }

    /// Deletes the record for `id`, returning whether one existed.
    pub async fn delete(&self, id: &str) -> Result<bool, Error> {
        self.store.delete(P::type_name(), id).await
    }

    /// Loads-or-creates `id`, folds a single event onto it and saves the
    /// result. Used by [`crate::projection::routed`] to drive one
    /// destination instance per routed event without exposing the
    /// lower-level `fold`/`save` pair to callers that don't need it.
    pub async fn fold_one(&self, id: &str, stream_id: &str, event: &StoredEvent) -> Result<(), Error> {
        let (mut state, mut record) = self.get_or_create(id).await?;
        self.fold(&mut state, &mut record, stream_id, std::slice::from_ref(event))?;
        self.save(&state, record).await
    }
}
