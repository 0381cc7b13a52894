//! The Data Store (C1): append/read of one stream's events, with atomic
//! per-event writes and close-sentinel enforcement.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use futures::stream::{iter, BoxStream, StreamExt};
use once_cell::sync::Lazy;
use tokio::sync::RwLock;

use crate::event::{self, NewEvent, StoredEvent, VersionSelect};
use crate::version::{self, Version};

/// Default maximum number of events a single atomic batch write may contain
/// before the Data Store splits the append into sequential batches.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default page size used by [`DataStore::read_as_stream`].
pub const DEFAULT_STREAMING_PAGE_SIZE: usize = 100;

/// Errors surfaced by [`DataStore::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The stream already bears a close sentinel; no further business
    /// events may be appended.
    #[error("stream is closed, no further events can be appended")]
    StreamClosed,

    /// A concurrent writer committed first; `(stream_id, version)` already
    /// exists for at least one of the events being appended.
    #[error("version conflict while appending events: {0}")]
    Conflict(#[from] version::ConflictError),

    /// `events` was empty.
    #[error("cannot append an empty batch of events")]
    EmptyBatch,

    /// A batch within a multi-batch append failed after `committed` earlier
    /// batches had already been persisted; the caller should recover via
    /// [`DataStore::remove_events_for_failed_commit`].
    #[error("append failed after {committed} events were already committed")]
    PartialFailure {
        /// Number of events from the head of the request that did commit.
        committed: usize,
        /// The underlying cause of the failure on the next batch.
        #[source]
        source: Box<AppendError>,
    },

    /// The backend reported an error outside the above taxonomy (Throttled,
    /// Transient, Fatal -- see [`crate::error`]).
    #[error("data store backend error: {0}")]
    Backend(#[from] crate::error::BackendError),
}

/// The append-only, per-stream Data Store contract.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Appends `events` to `stream_id` in order.
    ///
    /// `expected` carries the caller's optimistic-concurrency expectation
    /// about the stream's last committed version; `Check::Any`
    /// skips the check entirely. `preserve_timestamp` instructs the store to
    /// keep each event's [`NewEvent::preserved_timestamp`] instead of
    /// stamping "now" -- used by live migration to carry over original event
    /// times.
    async fn append(
        &self,
        stream_id: &str,
        expected: version::Check,
        preserve_timestamp: bool,
        events: Vec<NewEvent>,
    ) -> Result<Version, AppendError>;

    /// Reads events with `start_version <= version <= until_version`
    /// (inclusive), ordered by version. Returns `None` if the stream has
    /// never been written to (B2).
    async fn read(
        &self,
        stream_id: &str,
        start_version: Version,
        until_version: Option<Version>,
    ) -> Result<Option<Vec<StoredEvent>>, crate::error::BackendError>;

    /// Same selection as [`DataStore::read`], produced incrementally,
    /// `page_size` events at a time.
    fn read_as_stream<'a>(
        &'a self,
        stream_id: &'a str,
        select: VersionSelect,
        page_size: usize,
    ) -> BoxStream<'a, Result<StoredEvent, crate::error::BackendError>>;

    /// Best-effort, idempotent delete of a contiguous version range, used to
    /// recover from a [`AppendError::PartialFailure`]. Missing rows count as
    /// already removed.
    async fn remove_events_for_failed_commit(
        &self,
        stream_id: &str,
        from_version: Version,
        to_version: Version,
    ) -> Result<usize, crate::error::BackendError>;
}

/// Process-global cache of stream ids known to bear a close sentinel.
///
/// Monotonic by construction (streams never reopen), so it is
/// safe to read/write without external synchronization beyond the
/// [`DashSet`]'s own locking.
pub static CLOSED_STREAM_CACHE: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// Clears the process-global closed-stream cache.
///
/// Exposed for test scenarios that need a clean cache between runs; never
/// called from production code paths.
pub fn clear_closed_stream_cache() {
    CLOSED_STREAM_CACHE.clear();
}

#[derive(Debug, Default)]
struct Backend {
    streams: HashMap<String, Vec<StoredEvent>>,
}

/// In-memory reference implementation of [`DataStore`], backed by a
/// thread-safe [`HashMap`].
///
/// Used both for unit tests throughout this crate and as a fully usable
/// embedded store for small deployments (no external backend required).
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
    max_batch_size: usize,
    default_ttl_seconds: i64,
}

impl InMemory {
    /// Builds an [`InMemory`] store splitting appends larger than
    /// `max_batch_size` into sequential batches, as the real backend would.
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            backend: Arc::default(),
            max_batch_size,
            default_ttl_seconds: -1,
        }
    }

    /// Builds an [`InMemory`] store honoring [`crate::config::EngineConfig::max_batch_size`]
    /// and [`crate::config::EngineConfig::default_time_to_live_seconds`].
    pub fn with_config(config: &crate::config::EngineConfig) -> Self {
        Self {
            backend: Arc::default(),
            max_batch_size: config.max_batch_size,
            default_ttl_seconds: config.default_time_to_live_seconds,
        }
    }

    fn effective_max_batch_size(&self) -> usize {
        if self.max_batch_size == 0 {
            DEFAULT_MAX_BATCH_SIZE
        } else {
            self.max_batch_size
        }
    }

    /// `event_ttl`, falling back to the configured default when the event
    /// itself carries none; `-1` (or any negative value) means infinite, so
    /// no fallback is applied.
    fn effective_ttl(&self, event_ttl: Option<i64>) -> Option<i64> {
        event_ttl.or_else(|| (self.default_ttl_seconds >= 0).then_some(self.default_ttl_seconds))
    }
}

#[async_trait]
impl DataStore for InMemory {
    async fn append(
        &self,
        stream_id: &str,
        expected: version::Check,
        preserve_timestamp: bool,
        events: Vec<NewEvent>,
    ) -> Result<Version, AppendError> {
        if events.is_empty() {
            return Err(AppendError::EmptyBatch);
        }

        if CLOSED_STREAM_CACHE.contains(stream_id) {
            return Err(AppendError::StreamClosed);
        }

        let mut backend = self.backend.write().await;

        let existing = backend.streams.entry(stream_id.to_owned()).or_default();

        if existing.iter().any(StoredEvent::is_close_sentinel) {
            CLOSED_STREAM_CACHE.insert(stream_id.to_owned());
            return Err(AppendError::StreamClosed);
        }

        let last_version = existing.last().map(|e| e.version);

        if let version::Check::MustBe(expected_version) = expected {
            let actual = last_version.unwrap_or(0);
            if actual != expected_version {
                return Err(AppendError::Conflict(version::ConflictError {
                    expected: expected_version,
                    actual,
                }));
            }
        }

        let starting_version = last_version.map(|v| v + 1).unwrap_or(0);

        let batch_size = self.effective_max_batch_size();
        let mut committed = 0usize;

        for (batch_index, chunk) in events.chunks(batch_size).enumerate() {
            let chunk_start = starting_version + (batch_index * batch_size) as Version;

            // Simulate a transactional batch write: either all of `chunk`
            // lands, or none of it does.
            let mut persisted: Vec<StoredEvent> = chunk
                .iter()
                .enumerate()
                .map(|(i, new_event)| StoredEvent {
                    stream_id: stream_id.to_owned(),
                    version: chunk_start + i as Version,
                    event_type: new_event.event_type.clone(),
                    schema_version: new_event.schema_version,
                    payload: new_event.payload.clone(),
                    timestamp: if preserve_timestamp {
                        new_event.preserved_timestamp.unwrap_or_else(Utc::now)
                    } else {
                        Utc::now()
                    },
                    correlation_id: new_event.correlation_id.clone(),
                    causation_id: new_event.causation_id.clone(),
                    external_sequencer: new_event.external_sequencer,
                    ttl: self.effective_ttl(new_event.ttl),
                })
                .collect();

            existing.append(&mut persisted);
            committed += chunk.len();

            if chunk.iter().any(|e| e.event_type == event::CLOSE_SENTINEL_EVENT_TYPE) {
                CLOSED_STREAM_CACHE.insert(stream_id.to_owned());
            }
        }

        let _ = committed;

        Ok(existing.last().map(|e| e.version).unwrap_or(starting_version))
    }

    async fn read(
        &self,
        stream_id: &str,
        start_version: Version,
        until_version: Option<Version>,
    ) -> Result<Option<Vec<StoredEvent>>, crate::error::BackendError> {
        let backend = self.backend.read().await;

        let Some(events) = backend.streams.get(stream_id) else {
            return Ok(None);
        };

        let selected = events
            .iter()
            .filter(|e| {
                e.version >= start_version
                    && until_version.map_or(true, |until| e.version <= until)
            })
            .cloned()
            .collect();

        Ok(Some(selected))
    }

    fn read_as_stream<'a>(
        &'a self,
        stream_id: &'a str,
        select: VersionSelect,
        page_size: usize,
    ) -> BoxStream<'a, Result<StoredEvent, crate::error::BackendError>> {
        // The in-memory backend has no real page boundaries to respect, but
        // callers of `read_as_stream` should not assume the whole stream is
        // materialized eagerly; we fetch once and yield it item by item,
        // matching the incremental contract a real paged backend exposes.
        let stream_id = stream_id.to_owned();
        let _ = page_size;

        futures::stream::once(async move {
            let backend = self.backend.read().await;
            let events = backend.streams.get(&stream_id).cloned().unwrap_or_default();

            let (start, until) = match select {
                VersionSelect::All => (0, None),
                VersionSelect::From(v) => (v, None),
                VersionSelect::Range(from, to) => (from, Some(to)),
            };

            let filtered: Vec<_> = events
                .into_iter()
                .filter(|e| e.version >= start && until.map_or(true, |u| e.version <= u))
                .map(Ok)
                .collect();

            iter(filtered)
        })
        .flatten()
        .boxed()
    }

    async fn remove_events_for_failed_commit(
        &self,
        stream_id: &str,
        from_version: Version,
        to_version: Version,
    ) -> Result<usize, crate::error::BackendError> {
        let mut backend = self.backend.write().await;

        let Some(events) = backend.streams.get_mut(stream_id) else {
            return Ok(0);
        };

        let before = events.len();
        events.retain(|e| e.version < from_version || e.version > to_version);
        let removed = before - events.len();

        Ok(removed)
    }
}
