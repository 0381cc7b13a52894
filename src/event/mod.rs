//! Module `event` contains the Data Store (C1): the append-only, per-stream
//! event log that everything else in this crate is built on top of.
//!
//! Unlike the typed [`crate::message::Message`] layer used by aggregates and
//! projections, the Data Store itself is type-erased: it persists and reads
//! back [`StoredEvent`]s, whose `payload` is an opaque byte blob. Typed
//! dispatch happens one layer up, in [`crate::stream`] and [`crate::aggregate`],
//! using a [`crate::codec::Codec`] to move between `T: Message` and bytes.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// The event type name reserved for the close sentinel.
///
/// Once a `StoredEvent` with this `event_type` has been committed at some
/// version `k`, the Data Store must reject any further append at a version
/// greater than `k` for that stream.
pub const CLOSE_SENTINEL_EVENT_TYPE: &str = "EventStream.Closed";

/// Payload carried by the [`CLOSE_SENTINEL_EVENT_TYPE`] sentinel event.
///
/// Decoded from [`StoredEvent::payload`] whenever `event_type` matches the
/// sentinel; see [`StoredEvent::as_close_sentinel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClosed {
    /// Stream identifier that continues the history of the closed stream.
    pub continuation_stream_id: String,
    /// Backend tag of the continuation stream.
    pub continuation_stream_type: String,
    /// Data store backend name routing the continuation stream, if different
    /// from the default.
    pub continuation_data_store: Option<String>,
    /// Document store backend name routing the continuation document, if
    /// different from the default.
    pub continuation_document_store: Option<String>,
    /// Human-readable reason for the closure (e.g. `"Live migration to ..."`).
    pub reason: String,
    /// Wall-clock time the sentinel was appended.
    pub closed_at: DateTime<Utc>,
    /// Identifier of the migration run that produced this closure, if any.
    pub migration_id: Option<String>,
    /// The last business (non-sentinel) event version committed to the
    /// closed stream.
    pub last_business_event_version: Version,
}

/// A newly-appended event, before it has been assigned a [`Version`] or a
/// `timestamp` by the Data Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// The domain event type name (`Message::name()` at the typed layer).
    pub event_type: String,
    /// Schema version of the `payload` encoding, for payload evolution.
    pub schema_version: u32,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
    /// Timestamp to preserve verbatim instead of stamping "now"; used by
    /// live migration to carry over the original event time.
    pub preserved_timestamp: Option<DateTime<Utc>>,
    /// Correlates this event with others produced by the same business
    /// transaction or workflow.
    pub correlation_id: Option<String>,
    /// Identifies the event (or command) that caused this one to be recorded.
    pub causation_id: Option<String>,
    /// Caller-supplied ordering key for cross-stream causal ordering.
    pub external_sequencer: Option<i64>,
    /// Per-event time-to-live in seconds, `None` meaning "use the store
    /// default" and a negative value meaning "infinite".
    pub ttl: Option<i64>,
}

impl NewEvent {
    /// Builds a [`NewEvent`] with only the mandatory fields set; the rest
    /// default to `None`.
    pub fn new(event_type: impl Into<String>, schema_version: u32, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            payload,
            preserved_timestamp: None,
            correlation_id: None,
            causation_id: None,
            external_sequencer: None,
            ttl: None,
        }
    }

    /// Builds the [`NewEvent`] carrying the close sentinel payload.
    pub fn close_sentinel(payload: &StreamClosed) -> Self {
        let bytes = serde_json::to_vec(payload).expect("StreamClosed serializes to JSON");
        let mut event = Self::new(CLOSE_SENTINEL_EVENT_TYPE, 1, bytes);
        event.preserved_timestamp = Some(payload.closed_at);
        event
    }
}

/// An event that has been durably committed to the Data Store.
///
/// `(stream_id, version)` uniquely identifies a [`StoredEvent`]; it is
/// immutable once returned by [`store::DataStore::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Identifier of the stream this event belongs to.
    pub stream_id: String,
    /// Dense, monotonically increasing position within the stream.
    pub version: Version,
    /// Domain event type name.
    pub event_type: String,
    /// Schema version of `payload`.
    pub schema_version: u32,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
    /// Wall-clock time at append, or the preserved timestamp from a migrated
    /// source event.
    pub timestamp: DateTime<Utc>,
    /// See [`NewEvent::correlation_id`].
    pub correlation_id: Option<String>,
    /// See [`NewEvent::causation_id`].
    pub causation_id: Option<String>,
    /// See [`NewEvent::external_sequencer`].
    pub external_sequencer: Option<i64>,
    /// See [`NewEvent::ttl`].
    pub ttl: Option<i64>,
}

impl StoredEvent {
    /// Returns `true` if this record is the close sentinel.
    pub fn is_close_sentinel(&self) -> bool {
        self.event_type == CLOSE_SENTINEL_EVENT_TYPE
    }

    /// Decodes [`StreamClosed`] out of this record's payload, if it is the
    /// close sentinel.
    pub fn as_close_sentinel(&self) -> Option<StreamClosed> {
        if !self.is_close_sentinel() {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Specifies the slice of an Event Stream to select when reading.
///
/// Mirrors a `read(startVersion, untilVersion?)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    /// Selects every event in the stream, from version 0 onward.
    All,
    /// Selects events starting from the given [`Version`] (inclusive).
    From(Version),
    /// Selects events within the given inclusive range.
    Range(Version, Version),
}
