//! The Event Stream handle (C5): the mutable per-aggregate handle that ties
//! together the Data Store, Document Store and Snapshot Store behind a
//! single `fold`/`session` API.
//!
//! Rehydrates, applies, and records like a typical aggregate context would,
//! appending under `MustBe` and translating conflicts, with an added
//! retry-after-reread loop, a snapshot-cadence call-out, and post-commit
//! observer firing.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;

use crate::aggregate::Aggregate;
use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::document::{DocumentStore, ObjectDocument};
use crate::event::store::{AppendError, DataStore};
use crate::event::{NewEvent, StoredEvent, VersionSelect};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::version::Version;

/// Errors surfaced by [`Handle::fold`].
#[derive(Debug, thiserror::Error)]
pub enum FoldError<E> {
    /// No document exists for the requested `(object_name, object_id)`.
    #[error("aggregate not found")]
    NotFound,

    /// The aggregate's own `apply` rejected an event during replay.
    #[error("aggregate rejected event during replay: {0}")]
    Apply(#[source] E),

    /// A stored event's payload could not be decoded by the configured codec.
    #[error("failed to decode event payload")]
    Decode,

    /// The Document Store returned an error.
    #[error(transparent)]
    Document(#[from] crate::document::Error),

    /// The Data Store returned an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),

    /// The Snapshot Store returned an error.
    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::Error),
}

/// Errors surfaced by [`Handle::commit`].
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The stream already bears a close sentinel.
    #[error("stream is closed")]
    StreamClosed,

    /// A genuine concurrent writer beat this commit; the caller should
    /// reload the aggregate and retry its business logic.
    #[error("optimistic concurrency conflict: {0}")]
    OptimisticConcurrency(#[from] crate::version::ConflictError),

    /// The Document Store's CAS write kept losing to concurrent metadata
    /// updates after the configured number of retries.
    #[error("document update retries exhausted")]
    DocumentRetriesExhausted,

    /// The Data Store returned an error outside the conflict taxonomy.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// The Document Store returned an error outside the conflict taxonomy.
    #[error(transparent)]
    Document(#[from] crate::document::Error),

    /// The Snapshot Store returned an error.
    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::Error),
}

/// Maximum number of times [`Handle::commit`] re-reads the document and
/// retries its CAS write after a [`crate::document::Error::ConcurrencyConflict`].
const MAX_DOCUMENT_RETRIES: u32 = 3;

/// Fires strictly after a successful commit, in registration order.
///
/// Observer errors are logged and suppressed: they never roll back or fail
/// the commit that triggered them.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Called once per successful commit, after the document has been
    /// persisted.
    async fn on_document_updated(&self, document: &ObjectDocument) -> Result<(), anyhow::Error> {
        let _ = document;
        Ok(())
    }
}

/// A write transaction against one aggregate's stream: events appended here
/// are only durable once the enclosing [`Handle::session`] call returns
/// successfully.
pub struct Session<Evt> {
    starting_version: i64,
    pending: Vec<(Evt, NewEvent)>,
    _evt: PhantomData<Evt>,
}

impl<Evt> Session<Evt>
where
    Evt: crate::message::Message + Clone,
{
    fn new(starting_version: i64) -> Self {
        Self {
            starting_version,
            pending: Vec::new(),
            _evt: PhantomData,
        }
    }

    /// Records `event` for append on commit, encoding it with `codec`.
    pub fn append<C>(&mut self, event: Evt, codec: &C)
    where
        C: Codec<Evt>,
    {
        let event_type = event.name().to_owned();
        let payload = codec.serialize(event.clone());
        self.pending.push((event, NewEvent::new(event_type, 1, payload)));
    }

    /// The provisional version the stream will reach if this session commits.
    pub fn version(&self) -> i64 {
        self.starting_version + self.pending.len() as i64
    }

    /// Events recorded so far, not yet committed.
    pub fn uncommitted(&self) -> impl Iterator<Item = &Evt> {
        self.pending.iter().map(|(evt, _)| evt)
    }
}

/// The Event Stream handle.
pub struct Handle<C> {
    data_store: Arc<dyn DataStore>,
    document_store: Arc<dyn DocumentStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    codec: C,
    config: EngineConfig,
    observers: Vec<Arc<dyn Observer>>,
}

impl<C> Handle<C> {
    /// Builds a [`Handle`] over the given backends.
    pub fn new(
        data_store: Arc<dyn DataStore>,
        document_store: Arc<dyn DocumentStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        codec: C,
        config: EngineConfig,
    ) -> Self {
        Self {
            data_store,
            document_store,
            snapshot_store,
            codec,
            config,
            observers: Vec::new(),
        }
    }

    /// Registers an [`Observer`], fired in registration order after every
    /// successful commit.
    pub fn register_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Loads (creating if absent) the [`ObjectDocument`] for `(object_name, object_id)`.
    pub async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
        stream_type: &str,
    ) -> Result<ObjectDocument, crate::document::Error> {
        if let Some(doc) = self.document_store.get(object_name, object_id).await? {
            return Ok(doc);
        }

        let doc = ObjectDocument::new(object_name, object_id, stream_type);
        self.document_store.create(doc.clone()).await?;
        Ok(doc)
    }

    /// Rehydrates an aggregate: the latest eligible snapshot, then the event
    /// tail.
    pub async fn fold<A>(&self, document: &ObjectDocument) -> Result<A, FoldError<A::Error>>
    where
        A: Aggregate,
        C: Codec<A::Event>,
    {
        let stream_id = &document.active.stream_identifier;
        let current_version = document.active.current_stream_version;

        if current_version < 0 {
            return Err(FoldError::NotFound);
        }

        let snapshot = self
            .snapshot_store
            .latest_unnamed_up_to(stream_id, current_version as Version)
            .await?;

        let (mut state, replay_from): (Option<A>, Version) = match snapshot {
            Some(Snapshot { data, version, .. }) => {
                let state: A = serde_json::from_slice(&data).map_err(|_| FoldError::Decode)?;
                (Some(state), version + 1)
            }
            None => (None, 0),
        };

        let events = self
            .data_store
            .read(stream_id, replay_from, Some(current_version as Version))
            .await?
            .unwrap_or_default();

        for stored in events {
            if stored.is_close_sentinel() {
                continue;
            }

            let event: A::Event = self
                .codec
                .deserialize(stored.payload.clone())
                .map_err(|_| FoldError::Decode)?;

            state = Some(A::apply(state, event).map_err(FoldError::Apply)?);
        }

        state.ok_or(FoldError::NotFound)
    }

    /// Opens a write [`Session`] starting at `document`'s current version,
    /// runs `body` to accumulate events, then commits.
    ///
    /// On success, returns the updated [`ObjectDocument`] (with its new
    /// `active.current_stream_version` and hash chain). `body` returning an
    /// error aborts the session before anything is written.
    pub async fn session<Evt, F, T, E>(
        &self,
        mut document: ObjectDocument,
        body: F,
    ) -> Result<(ObjectDocument, T), SessionError<E>>
    where
        Evt: crate::message::Message + Clone,
        C: Codec<Evt>,
        F: FnOnce(&mut Session<Evt>) -> Result<T, E>,
    {
        let starting_version = document.active.current_stream_version;
        let mut session = Session::new(starting_version);

        let result = body(&mut session).map_err(SessionError::Body)?;

        if session.pending.is_empty() {
            return Ok((document, result));
        }

        document = self
            .commit(document, session.pending.into_iter().map(|(_, new_event)| new_event).collect())
            .await
            .map_err(SessionError::Commit)?;

        Ok((document, result))
    }

    /// The commit protocol proper.
    async fn commit(
        &self,
        mut document: ObjectDocument,
        events: Vec<NewEvent>,
    ) -> Result<ObjectDocument, CommitError> {
        let stream_id = document.active.stream_identifier.clone();
        let starting_version = document.active.current_stream_version;
        let expected = if starting_version < 0 {
            None
        } else {
            Some(starting_version as Version)
        };
        let event_count = events.len();
        let check = expected.map_or(crate::version::Check::Any, crate::version::Check::MustBe);

        let new_version = match self.data_store.append(&stream_id, check, false, events.clone()).await {
            Ok(v) => v,
            Err(AppendError::StreamClosed) => return Err(CommitError::StreamClosed),
            Err(AppendError::Conflict(conflict)) => {
                // Diagnose: was this our own retried write (idempotent), or a
                // genuine concurrent writer?
                if self.is_idempotent_retry(&stream_id, expected, &events).await {
                    expected.map_or(event_count as Version - 1, |v| v + event_count as Version)
                } else {
                    return Err(CommitError::OptimisticConcurrency(conflict));
                }
            }
            Err(AppendError::PartialFailure { committed, source }) => {
                let from = expected.map_or(0, |v| v + 1);
                let to = from + event_count as Version - 1;
                let _ = self
                    .data_store
                    .remove_events_for_failed_commit(&stream_id, from + committed as Version, to)
                    .await;
                return Err(CommitError::Append(*source));
            }
            Err(err) => return Err(CommitError::Append(err)),
        };

        document.active.current_stream_version = new_version as i64;

        let mut attempts = 0;
        loop {
            document.rehash();

            match self
                .document_store
                .set(document.clone(), self.config.use_optimistic_concurrency)
                .await
            {
                Ok(()) => break,
                Err(crate::document::Error::ConcurrencyConflict { .. }) if attempts < MAX_DOCUMENT_RETRIES => {
                    attempts += 1;
                    if let Some(fresh) = self
                        .document_store
                        .get(&document.object_name, &document.object_id)
                        .await?
                    {
                        document = fresh;
                        document.active.current_stream_version = new_version as i64;
                    }
                }
                Err(crate::document::Error::ConcurrencyConflict { .. }) => {
                    return Err(CommitError::DocumentRetriesExhausted)
                }
                Err(err) => return Err(CommitError::Document(err)),
            }
        }

        for observer in &self.observers {
            if let Err(err) = observer.on_document_updated(&document).await {
                tracing_log_observer_failure(&err);
            }
        }

        Ok(document)
    }

    /// Writes a snapshot for `document` if the configured cadence is due at
    /// its current version, called by aggregate-level callers right after a
    /// successful [`Handle::session`].
    pub async fn snapshot_if_due<A: Aggregate>(
        &self,
        document: &ObjectDocument,
        state: &A,
    ) -> Result<(), crate::snapshot::Error>
    where
        A: serde::Serialize,
    {
        let cadence = self.config.snapshot_every;
        if cadence == 0 {
            return Ok(());
        }

        let version = document.active.current_stream_version;
        if version < 0 || (version as u64) % u64::from(cadence) != 0 {
            return Ok(());
        }

        let data = serde_json::to_vec(state).expect("aggregate state serializes to JSON");

        self.snapshot_store
            .set(Snapshot {
                stream_id: document.active.stream_identifier.clone(),
                version: version as Version,
                name: None,
                data,
                data_type_name: std::any::type_name::<A>().to_owned(),
                created_at: Utc::now(),
            })
            .await
    }

    /// Streams `stream_id`'s events matching `select`, paging internally at
    /// [`EngineConfig::streaming_page_size`] rather than the caller having to
    /// pick a page size per call site.
    pub fn read_as_stream<'a>(
        &'a self,
        stream_id: &'a str,
        select: VersionSelect,
    ) -> BoxStream<'a, Result<StoredEvent, crate::error::BackendError>> {
        self.data_store.read_as_stream(stream_id, select, self.config.streaming_page_size)
    }

    async fn is_idempotent_retry(&self, stream_id: &str, expected: Option<Version>, events: &[NewEvent]) -> bool {
        let Ok(Some(stored)) = self
            .data_store
            .read(stream_id, expected.map_or(0, |v| v + 1), None)
            .await
        else {
            return false;
        };

        if stored.len() < events.len() {
            return false;
        }

        stored
            .iter()
            .zip(events.iter())
            .all(|(s, e)| s.event_type == e.event_type && s.payload == e.payload)
    }
}

/// Errors surfaced by [`Handle::session`]: either the caller's own `body`
/// closure failed (nothing was written), or the commit protocol failed
/// after `body` succeeded.
#[derive(Debug, thiserror::Error)]
pub enum SessionError<E> {
    /// `body` returned an error; no events were appended.
    #[error("session body failed: {0}")]
    Body(E),

    /// The commit protocol failed after events were recorded in the session.
    #[error(transparent)]
    Commit(#[from] CommitError),
}

fn tracing_log_observer_failure(err: &anyhow::Error) {
    #[cfg(feature = "tracing")]
    tracing::warn!(error = %err, "observer failed after commit, suppressing");
    #[cfg(not(feature = "tracing"))]
    let _ = err;
}

/// Logs a [`Handle::snapshot_if_due`] failure the same way
/// [`tracing_log_observer_failure`] logs a failed observer: the snapshot is
/// best-effort cadence bookkeeping, not part of the commit itself, so a
/// failure here is suppressed rather than surfaced to the caller.
pub(crate) fn tracing_log_snapshot_failure(err: &crate::snapshot::Error) {
    #[cfg(feature = "tracing")]
    tracing::warn!(error = %err, "snapshot_if_due failed after commit, suppressing");
    #[cfg(not(feature = "tracing"))]
    let _ = err;
}

/// Fetches every event of a stream excluding the close sentinel, honoring
/// [`VersionSelect`]. Thin convenience over [`DataStore::read`] for
/// call sites that only care about business events.
pub async fn business_events(
    data_store: &dyn DataStore,
    stream_id: &str,
    select: VersionSelect,
) -> Result<Vec<StoredEvent>, crate::error::BackendError> {
    let (start, until) = match select {
        VersionSelect::All => (0, None),
        VersionSelect::From(v) => (v, None),
        VersionSelect::Range(from, to) => (from, Some(to)),
    };

    Ok(data_store
        .read(stream_id, start, until)
        .await?
        .unwrap_or_default()
        .into_iter()
        .filter(|e| !e.is_close_sentinel())
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::Json;
    use crate::event::store::InMemory as InMemoryDataStore;
    use crate::document::InMemory as InMemoryDocumentStore;
    use crate::snapshot::InMemory as InMemorySnapshotStore;
    use crate::message::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum TestEvent {
        Created,
        Incremented,
    }

    impl Message for TestEvent {
        fn name(&self) -> &'static str {
            match self {
                TestEvent::Created => "Created",
                TestEvent::Incremented => "Incremented",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    impl Aggregate for Counter {
        type Event = TestEvent;
        type Error = std::convert::Infallible;

        fn type_name() -> &'static str {
            "counter"
        }

        fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error> {
            let mut state = state.unwrap_or(Counter { value: 0 });
            if matches!(event, TestEvent::Incremented) {
                state.value += 1;
            }
            Ok(state)
        }
    }

    fn handle() -> Handle<Json<TestEvent>> {
        Handle::new(
            Arc::new(InMemoryDataStore::default()),
            Arc::new(InMemoryDocumentStore::default()),
            Arc::new(InMemorySnapshotStore::default()),
            Json::default(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn session_commits_events_and_fold_observes_them() {
        crate::event::store::clear_closed_stream_cache();
        let handle = handle();

        let document = handle.get_or_create("counter", "c1", "counter-stream").await.unwrap();

        let (document, ()) = handle
            .session::<TestEvent, _, _, std::convert::Infallible>(document, |session| {
                session.append(TestEvent::Created, &Json::default());
                session.append(TestEvent::Incremented, &Json::default());
                session.append(TestEvent::Incremented, &Json::default());
                Ok(())
            })
            .await
            .expect("session should commit");

        assert_eq!(document.active.current_stream_version, 2);

        let state: Counter = handle.fold(&document).await.expect("fold should succeed");
        assert_eq!(state.value, 2);
    }

    #[tokio::test]
    async fn concurrent_writer_is_rejected_then_retry_succeeds() {
        crate::event::store::clear_closed_stream_cache();
        let handle = handle();

        let document = handle.get_or_create("counter", "c2", "counter-stream").await.unwrap();
        let (stale_document, ()) = handle
            .session::<TestEvent, _, _, std::convert::Infallible>(document, |session| {
                session.append(TestEvent::Created, &Json::default());
                Ok(())
            })
            .await
            .expect("first writer should commit");

        // A second writer commits version 1 first, using the same stale
        // document both writers read.
        let (fresh_document, ()) = handle
            .session::<TestEvent, _, _, std::convert::Infallible>(stale_document.clone(), |session| {
                session.append(TestEvent::Incremented, &Json::default());
                Ok(())
            })
            .await
            .expect("second writer should commit");
        assert_eq!(fresh_document.active.current_stream_version, 1);

        // The first writer's stale handle now retries its own append against
        // the outdated document and must observe a genuine conflict: its
        // event differs from the one the second writer already committed at
        // the same version, so this cannot be mistaken for an idempotent
        // retry.
        let err = handle
            .session::<TestEvent, _, _, std::convert::Infallible>(stale_document, |session| {
                session.append(TestEvent::Created, &Json::default());
                Ok(())
            })
            .await
            .expect_err("stale writer should conflict");
        assert!(matches!(err, SessionError::Commit(CommitError::OptimisticConcurrency(_))));

        // Re-reading the document and retrying succeeds.
        let document = handle.get_or_create("counter", "c2", "counter-stream").await.unwrap();
        let (document, ()) = handle
            .session::<TestEvent, _, _, std::convert::Infallible>(document, |session| {
                session.append(TestEvent::Incremented, &Json::default());
                Ok(())
            })
            .await
            .expect("retry after re-read should commit");
        assert_eq!(document.active.current_stream_version, 2);
    }

    #[tokio::test]
    async fn read_as_stream_uses_the_configured_streaming_page_size() {
        crate::event::store::clear_closed_stream_cache();
        let mut config = EngineConfig::default();
        config.streaming_page_size = 2;

        let handle = Handle::new(
            Arc::new(InMemoryDataStore::default()),
            Arc::new(InMemoryDocumentStore::default()),
            Arc::new(InMemorySnapshotStore::default()),
            Json::<TestEvent>::default(),
            config,
        );

        let document = handle.get_or_create("counter", "c3", "counter-stream").await.unwrap();
        handle
            .session::<TestEvent, _, _, std::convert::Infallible>(document, |session| {
                session.append(TestEvent::Created, &Json::default());
                session.append(TestEvent::Incremented, &Json::default());
                session.append(TestEvent::Incremented, &Json::default());
                Ok(())
            })
            .await
            .unwrap();

        use futures::TryStreamExt;
        let events: Vec<_> = handle
            .read_as_stream("counter-c3", VersionSelect::All)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn fold_on_missing_document_is_not_found() {
        crate::event::store::clear_closed_stream_cache();
        let handle = handle();
        let document = ObjectDocument::new("counter", "missing", "counter-stream");

        let err = handle.fold::<Counter>(&document).await.expect_err("should not be found");
        assert!(matches!(err, FoldError::NotFound));
    }
}
