//! Instrumentation decorators for the storage traits, built with the
//! `tracing` crate.
//!
//! Wraps a backend in a struct that forwards every call through
//! `#[instrument]`, and offers a `.with_tracing()` extension method so call
//! sites can opt in without changing their trait bounds.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::instrument;

use crate::document::{self, DocumentStore, ObjectDocument};
use crate::event::store::{AppendError, DataStore};
use crate::event::{NewEvent, StoredEvent, VersionSelect};
use crate::version::Version;

/// [`DataStore`] wrapper that instruments every call via `tracing`.
#[derive(Debug, Clone)]
pub struct InstrumentedDataStore<Inner> {
    inner: Inner,
}

#[async_trait]
impl<Inner> DataStore for InstrumentedDataStore<Inner>
where
    Inner: DataStore,
{
    #[instrument(name = "event::store::DataStore.append", skip(self, events), fields(event_count = events.len()), err)]
    async fn append(&self, stream_id: &str, expected: crate::version::Check, preserve_timestamp: bool, events: Vec<NewEvent>) -> Result<Version, AppendError> {
        self.inner.append(stream_id, expected, preserve_timestamp, events).await
    }

    #[instrument(name = "event::store::DataStore.read", skip(self), err)]
    async fn read(&self, stream_id: &str, start_version: Version, until_version: Option<Version>) -> Result<Option<Vec<StoredEvent>>, crate::error::BackendError> {
        self.inner.read(stream_id, start_version, until_version).await
    }

    fn read_as_stream<'a>(&'a self, stream_id: &'a str, select: VersionSelect, page_size: usize) -> BoxStream<'a, Result<StoredEvent, crate::error::BackendError>> {
        self.inner.read_as_stream(stream_id, select, page_size)
    }

    #[instrument(name = "event::store::DataStore.remove_events_for_failed_commit", skip(self), err)]
    async fn remove_events_for_failed_commit(&self, stream_id: &str, from_version: Version, to_version: Version) -> Result<usize, crate::error::BackendError> {
        self.inner.remove_events_for_failed_commit(stream_id, from_version, to_version).await
    }
}

/// Extension trait offering `.with_tracing()` on any [`DataStore`].
pub trait DataStoreExt: DataStore + Sized {
    /// Wraps `self` in an [`InstrumentedDataStore`].
    fn with_tracing(self) -> InstrumentedDataStore<Self> {
        InstrumentedDataStore { inner: self }
    }
}

impl<T: DataStore> DataStoreExt for T {}

/// [`DocumentStore`] wrapper that instruments every call via `tracing`.
#[derive(Debug, Clone)]
pub struct InstrumentedDocumentStore<Inner> {
    inner: Inner,
}

#[async_trait]
impl<Inner> DocumentStore for InstrumentedDocumentStore<Inner>
where
    Inner: DocumentStore,
{
    #[instrument(name = "document::DocumentStore.create", skip(self, document), fields(object_name = %document.object_name, object_id = %document.object_id), err)]
    async fn create(&self, document: ObjectDocument) -> Result<(), document::Error> {
        self.inner.create(document).await
    }

    #[instrument(name = "document::DocumentStore.get", skip(self), err)]
    async fn get(&self, object_name: &str, object_id: &str) -> Result<Option<ObjectDocument>, document::Error> {
        self.inner.get(object_name, object_id).await
    }

    #[instrument(name = "document::DocumentStore.set", skip(self, document), fields(object_name = %document.object_name, object_id = %document.object_id), err)]
    async fn set(&self, document: ObjectDocument, use_optimistic_concurrency: bool) -> Result<(), document::Error> {
        self.inner.set(document, use_optimistic_concurrency).await
    }
}

/// Extension trait offering `.with_tracing()` on any [`DocumentStore`].
pub trait DocumentStoreExt: DocumentStore + Sized {
    /// Wraps `self` in an [`InstrumentedDocumentStore`].
    fn with_tracing(self) -> InstrumentedDocumentStore<Self> {
        InstrumentedDocumentStore { inner: self }
    }
}

impl<T: DocumentStore> DocumentStoreExt for T {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::store::InMemory;

    fn event(name: &str) -> NewEvent {
        NewEvent::new(name, 1, name.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn instrumented_data_store_forwards_calls() {
        crate::event::store::clear_closed_stream_cache();
        let store = InMemory::default().with_tracing();

        let version = store.append("s1", crate::version::Check::Any, false, vec![event("a")]).await.unwrap();
        assert_eq!(version, 0);

        let events = store.read("s1", 0, None).await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
    }
}
