//! A single in-process backend bundle, wiring every component's `InMemory`
//! reference implementation together behind one constructor.
//!
//! Bundles the full set of stores this crate's components need, each
//! guarded by its own lock so independent stores don't contend.

use std::sync::Arc;

use crate::document;
use crate::document::provider;
use crate::event::store as event_store;
use crate::projection;
use crate::projection::status;
use crate::snapshot;
use crate::tag;

/// Every in-memory backend this crate defines, constructed together so a
/// caller wiring up a [`crate::stream::Handle`] (or the whole engine, in
/// tests) doesn't have to instantiate each one by hand.
#[derive(Debug, Clone, Default)]
pub struct Backends {
    /// The Data Store (C1).
    pub data_store: event_store::InMemory,
    /// The Document Store (C2).
    pub document_store: document::InMemory,
    /// The Tag Store (C3).
    pub tag_store: tag::InMemory,
    /// The Snapshot Store (C4).
    pub snapshot_store: snapshot::InMemory,
    /// The Object-ID Provider (C11).
    pub object_id_provider: provider::InMemory,
    /// Backing store for the Projection Runtime (C7).
    pub projection_store: projection::InMemory,
    /// Backing store for the Projection Status Coordinator (C9).
    pub projection_status_store: status::InMemory,
}

impl Backends {
    /// Builds a fresh, empty set of in-memory backends, all using
    /// [`crate::config::EngineConfig::default`]'s settings.
    ///
    /// `document_store` is wired to `object_id_provider` via
    /// [`document::InMemory::with_provider`], so every document created or
    /// updated through this bundle's `document_store` is immediately visible
    /// through `object_id_provider`'s `exists`/`count`/`page` -- callers
    /// never need to invoke [`provider::InMemory::observe`] themselves.
    pub fn new() -> Self {
        let object_id_provider = provider::InMemory::new();
        Self {
            document_store: document::InMemory::with_provider(object_id_provider.clone()),
            object_id_provider,
            ..Self::default()
        }
    }

    /// Builds a fresh set of in-memory backends honoring `config`'s
    /// `max_batch_size` and `default_time_to_live_seconds` for the Data
    /// Store, the same `config` a [`crate::stream::Handle`] built from this
    /// bundle via [`Backends::handle`] should be passed. `document_store` and
    /// `object_id_provider` are wired together exactly as in [`Backends::new`].
    pub fn with_config(config: &crate::config::EngineConfig) -> Self {
        let object_id_provider = provider::InMemory::new();
        Self {
            data_store: event_store::InMemory::with_config(config),
            document_store: document::InMemory::with_provider(object_id_provider.clone()),
            object_id_provider,
            ..Self::default()
        }
    }

    /// Builds a [`crate::stream::Handle`] over this bundle's Data, Document
    /// and Snapshot stores, using `codec` to (de)serialize events.
    pub fn handle<C>(&self, codec: C, config: crate::config::EngineConfig) -> crate::stream::Handle<C> {
        crate::stream::Handle::new(
            Arc::new(self.data_store.clone()),
            Arc::new(self.document_store.clone()),
            Arc::new(self.snapshot_store.clone()),
            codec,
            config,
        )
    }

    /// Builds a [`crate::resilience::RetryPolicy`] honoring `config`'s
    /// `max_retry_attempts`, for callers that wrap this bundle's stores in
    /// retry logic (the in-memory backends themselves never fail with a
    /// retryable error, but a network-backed implementation swapped in for
    /// `data_store`/`document_store` would).
    pub fn retry_policy(&self, config: &crate::config::EngineConfig) -> crate::resilience::RetryPolicy {
        crate::resilience::RetryPolicy::from_config(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::Json;
    use crate::config::EngineConfig;
    use crate::document::ObjectDocument;
    use crate::event::store::clear_closed_stream_cache;
    use crate::message::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Pinged;

    impl Message for Pinged {
        fn name(&self) -> &'static str {
            "Pinged"
        }
    }

    #[tokio::test]
    async fn handle_built_from_backends_round_trips_a_session() {
        clear_closed_stream_cache();
        let backends = Backends::new();
        let handle = backends.handle(Json::<Pinged>::default(), EngineConfig::default());

        let document = handle.get_or_create("probe", "p1", "probe-stream").await.unwrap();
        let (document, ()) = handle
            .session::<Pinged, _, _, std::convert::Infallible>(document, |session| {
                session.append(Pinged, &Json::default());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(document.active.current_stream_version, 0);
        let _: ObjectDocument = document;
    }

    #[tokio::test]
    async fn object_id_provider_observes_documents_written_through_the_bundled_handle() {
        use crate::document::provider::ObjectIdProvider;

        clear_closed_stream_cache();
        let backends = Backends::new();
        let handle = backends.handle(Json::<Pinged>::default(), EngineConfig::default());

        handle.get_or_create("probe", "p1", "probe-stream").await.unwrap();

        assert!(backends.object_id_provider.exists("probe", "p1").await.unwrap());
        assert_eq!(backends.object_id_provider.count("probe").await.unwrap(), 1);
    }
}
