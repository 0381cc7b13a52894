//! Engine-wide configuration.
//!
//! A single `Default`-able config struct with sensible defaults for the
//! in-memory backend, rather than requiring callers to wire every knob by
//! hand.

use serde::{Deserialize, Serialize};

/// Logical container/table names for each record family this crate
/// persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNames {
    /// Logical database/keyspace name.
    pub database_name: String,
    /// Container holding [`crate::document::ObjectDocument`] records.
    pub documents_container_name: String,
    /// Container holding [`crate::event::StoredEvent`] records.
    pub events_container_name: String,
    /// Container holding [`crate::snapshot::Snapshot`] records.
    pub snapshots_container_name: String,
    /// Container holding projection state records.
    pub projections_container_name: String,
    /// Container holding document-scoped [`crate::tag::TagEntry`] records.
    pub document_tags_container_name: String,
    /// Container holding stream-scoped [`crate::tag::TagEntry`] records.
    pub stream_tags_container_name: String,
}

impl Default for ContainerNames {
    fn default() -> Self {
        Self {
            database_name: "eventually".to_owned(),
            documents_container_name: "documents".to_owned(),
            events_container_name: "events".to_owned(),
            snapshots_container_name: "snapshots".to_owned(),
            projections_container_name: "projections".to_owned(),
            document_tags_container_name: "document-tags".to_owned(),
            stream_tags_container_name: "stream-tags".to_owned(),
        }
    }
}

/// Per-container-family throughput setting, mirroring cloud document
/// databases' autoscale-vs-manual RU/throughput split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Throughput {
    /// Scale automatically up to the given ceiling.
    Autoscale {
        /// Maximum throughput the backend may scale up to.
        max: u32,
    },
    /// Fixed, manually-provisioned throughput.
    Manual {
        /// The provisioned throughput value.
        value: u32,
    },
}

/// Backend default routing names, used when a document omits an explicit
/// override in its [`crate::document::BackendRouting`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultBackends {
    /// Default data store backend name.
    pub data_store: Option<String>,
    /// Default document store backend name.
    pub document_store: Option<String>,
    /// Default document-tag store backend name.
    pub document_tag_store: Option<String>,
    /// Default snapshot store backend name.
    pub snapshot_store: Option<String>,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logical container/table names.
    pub containers: ContainerNames,

    /// Create containers on first touch rather than requiring them
    /// pre-provisioned.
    pub auto_create_containers: bool,

    /// Appends larger than this are split into sequential batches.
    pub max_batch_size: usize,

    /// Page size for [`crate::event::store::DataStore::read_as_stream`].
    pub streaming_page_size: usize,

    /// When `false`, [`crate::document::DocumentStore::set`] performs an
    /// unconditional upsert instead of a CAS write.
    pub use_optimistic_concurrency: bool,

    /// Default per-event time-to-live in seconds; `-1` means infinite.
    pub default_time_to_live_seconds: i64,

    /// Backend routing defaults.
    pub default_backends: DefaultBackends,

    /// Snapshot cadence: a snapshot is written every `snapshot_every`
    /// committed events, or never when `0`.
    pub snapshot_every: u32,

    /// Maximum number of retry attempts [`crate::resilience::RetryPolicy`]
    /// makes on throttled/transient backend errors.
    pub max_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            containers: ContainerNames::default(),
            auto_create_containers: true,
            max_batch_size: crate::event::store::DEFAULT_MAX_BATCH_SIZE,
            streaming_page_size: crate::event::store::DEFAULT_STREAMING_PAGE_SIZE,
            use_optimistic_concurrency: true,
            default_time_to_live_seconds: -1,
            default_backends: DefaultBackends::default(),
            snapshot_every: 0,
            max_retry_attempts: 5,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sensible_for_the_in_memory_backend() {
        let config = EngineConfig::default();
        assert_eq!(config.streaming_page_size, 100);
        assert_eq!(config.default_time_to_live_seconds, -1);
        assert!(config.use_optimistic_concurrency);
        assert!(config.auto_create_containers);
    }
}
