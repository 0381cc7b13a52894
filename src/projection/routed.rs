//! The Routed Projection (C8): fans the events of one stream out to
//! several independently-typed destination projections, each keyed by its
//! own routing function and tracked by its own external checkpoint.
//!
//! Builds on [`crate::projection::Factory`] -- one async dispatch entry
//! point per registered destination -- with a per-destination checkpoint,
//! since a router's destinations can lag each other arbitrarily (a slow
//! destination must not block a fast one, nor silently skip events when it
//! catches back up).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::codec::Codec;
use crate::event::StoredEvent;
use crate::message::Message;
use crate::version::Version;

use super::{Error, Factory, Projection, ProjectionRecord, ProjectionStore};

/// One fan-out target of a [`Router`]: a single [`Projection`] type, reached
/// through its own [`Factory`], with its own function mapping an incoming
/// event to the destination instance id it belongs to.
#[async_trait]
pub trait Destination: Send + Sync {
    /// The name this destination is registered and looked up under.
    fn name(&self) -> &str;

    /// Creates the backing instance for `id` if it doesn't exist yet,
    /// without waiting for the first routed event to arrive.
    async fn create_instance(&self, id: &str) -> Result<(), Error>;

    /// Attempts to decode and fold `event` onto the destination instance its
    /// routing function selects, returning the instance id it was folded
    /// onto. Returns `None` if `event`'s payload isn't decodable as this
    /// destination's event type (the event simply isn't meant for this
    /// destination) rather than treating that as an error.
    async fn handle(&self, stream_id: &str, event: &StoredEvent) -> Result<Option<String>, Error>;
}

/// Binds one [`Projection`] type to a [`Router`] as a named [`Destination`].
pub struct Entry<P, S, C> {
    name: String,
    factory: Factory<P, S, C>,
    route: Arc<dyn Fn(&P::Event) -> String + Send + Sync>,
}

impl<P, S, C> Entry<P, S, C>
where
    P: Projection,
    S: ProjectionStore,
    C: Codec<P::Event>,
{
    /// Builds an [`Entry`] for projection type `P`, routing each decoded
    /// event to a destination instance id via `route`.
    pub fn new(name: impl Into<String>, factory: Factory<P, S, C>, route: impl Fn(&P::Event) -> String + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            factory,
            route: Arc::new(route),
        }
    }
}

#[async_trait]
impl<P, S, C> Destination for Entry<P, S, C>
where
    P: Projection,
    S: ProjectionStore,
    C: Codec<P::Event>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_instance(&self, id: &str) -> Result<(), Error> {
        let (state, record) = self.factory.get_or_create(id).await?;
        self.factory.save(&state, record).await?;
        let _ = state;
        Ok(())
    }

    async fn handle(&self, stream_id: &str, event: &StoredEvent) -> Result<Option<String>, Error> {
        if event.is_close_sentinel() {
            return Ok(None);
        }

        let Ok(decoded) = self.factory.codec().deserialize(event.payload.clone()) else {
            return Ok(None);
        };

        let id = (self.route)(&decoded);
        self.factory.fold_one(&id, stream_id, event).await?;
        Ok(Some(id))
    }
}

/// Per-destination record of how far a [`Router`] has forwarded a given
/// source stream, independent of each destination's own internal checkpoint.
/// This lets the router skip re-dispatching events a destination has
/// already been handed, even if that destination's own fold is still
/// catching up.
type ExternalCheckpoints = HashMap<String, HashMap<String, Version>>;

/// One entry in a [`Router`]'s durable destination registry: where a
/// specific destination instance lives and what type it is, per spec.md's
/// `destinationKey -> {destinationTypeName, blobPath, metadata}` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// [`Destination::name`] of the destination type this key was created on.
    pub destination_type_name: String,
    /// Addressable location of the sub-projection's own persisted record.
    pub blob_path: String,
    /// Destination-specific metadata, opaque to the router.
    pub metadata: HashMap<String, String>,
}

/// The part of a [`Router`]'s state that is serialized into its
/// [`ProjectionRecord::data`] -- the durable registry plus the per-
/// destination forwarding checkpoints. The main projection document carries
/// only this (checkpoint + registry); each destination's own read-model
/// state is persisted separately through its own [`Factory`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    registry: HashMap<String, RegistryEntry>,
    checkpoints: ExternalCheckpoints,
}

/// Schema marker stored in [`ProjectionRecord::checkpoint_fingerprint`] for
/// router records; routers don't have a handled-event-type set to fingerprint
/// the way a [`Projection`] does; the router's own registry/checkpoint load
/// path reads this record directly rather than going through
/// [`Factory::get_or_create`], so no fingerprint mismatch check ever applies.
const SCHEMA_MARKER: &str = "routed-projection-registry-v1";

/// Fans events out to a registry of named [`Destination`]s, persisting which
/// destination instances exist and how far each has been forwarded so both
/// survive a process restart.
pub struct Router<S> {
    type_name: String,
    id: String,
    store: S,
    destinations: Vec<Arc<dyn Destination>>,
    registry: RwLock<HashMap<String, RegistryEntry>>,
    checkpoints: RwLock<ExternalCheckpoints>,
}

impl<S> Router<S>
where
    S: ProjectionStore,
{
    /// Loads the durable registry and checkpoints for `(type_name, id)` from
    /// `store`, or starts a fresh, empty one if none is persisted yet.
    pub async fn load_or_create(type_name: impl Into<String>, id: impl Into<String>, store: S) -> Result<Self, Error> {
        let type_name = type_name.into();
        let id = id.into();

        let persisted = match store.load(&type_name, &id).await? {
            Some(record) => serde_json::from_slice::<PersistedState>(&record.data).map_err(|_| Error::CorruptState)?,
            None => PersistedState::default(),
        };

        Ok(Self {
            type_name,
            id,
            store,
            destinations: Vec::new(),
            registry: RwLock::new(persisted.registry),
            checkpoints: RwLock::new(persisted.checkpoints),
        })
    }

    /// Registers `destination`. Compile-time wiring of a destination type;
    /// not persisted, since the binary doing the wiring owns it.
    pub fn add_destination(&mut self, destination: Arc<dyn Destination>) {
        self.destinations.push(destination);
    }

    /// Eagerly creates `id` on the named destination, bypassing routing, and
    /// records it in the durable registry.
    pub async fn create_destination_instance(&self, destination_name: &str, id: &str) -> Result<(), Error> {
        for destination in &self.destinations {
            if destination.name() == destination_name {
                destination.create_instance(id).await?;
                self.note_destination_instance(destination_name, id).await;
                return self.persist().await;
            }
        }
        Err(Error::NotFound)
    }

    /// Offers every event in `events` (from `stream_id`) to every registered
    /// destination, skipping events a destination has already been handed
    /// per its external checkpoint. Any newly created destination instance
    /// and the advanced checkpoints are persisted once at the end.
    pub async fn route(&self, stream_id: &str, events: &[StoredEvent]) -> Result<(), Error> {
        let mut dirty = false;

        for destination in &self.destinations {
            for event in events {
                let already_forwarded = {
                    let checkpoints = self.checkpoints.read().await;
                    checkpoints
                        .get(destination.name())
                        .and_then(|per_stream| per_stream.get(stream_id))
                        .is_some_and(|last| event.version <= *last)
                };

                if already_forwarded {
                    continue;
                }

                if let Some(id) = destination.handle(stream_id, event).await? {
                    self.note_destination_instance(destination.name(), &id).await;
                    dirty = true;
                }

                let mut checkpoints = self.checkpoints.write().await;
                checkpoints
                    .entry(destination.name().to_owned())
                    .or_default()
                    .insert(stream_id.to_owned(), event.version);
            }
        }

        if dirty {
            self.persist().await?;
        }

        Ok(())
    }

    /// Returns the durable registry entry for `destination_key`, if any
    /// instance has been created under that key.
    pub async fn registry_entry(&self, destination_key: &str) -> Option<RegistryEntry> {
        self.registry.read().await.get(destination_key).cloned()
    }

    async fn note_destination_instance(&self, destination_name: &str, id: &str) {
        let key = format!("{destination_name}:{id}");
        let mut registry = self.registry.write().await;
        registry.entry(key).or_insert_with(|| RegistryEntry {
            destination_type_name: destination_name.to_owned(),
            blob_path: format!("{destination_name}/{id}"),
            metadata: HashMap::new(),
        });
    }

    async fn persist(&self) -> Result<(), Error> {
        let state = PersistedState {
            registry: self.registry.read().await.clone(),
            checkpoints: self.checkpoints.read().await.clone(),
        };

        self.store
            .save(ProjectionRecord {
                type_name: self.type_name.clone(),
                id: self.id.clone(),
                data: serde_json::to_vec(&state).expect("router state serializes to JSON"),
                checkpoint: HashMap::new(),
                checkpoint_fingerprint: SCHEMA_MARKER.to_owned(),
                updated_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codec::Json;
    use crate::projection::InMemory as InMemoryProjectionStore;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TenantEvent {
        tenant: String,
    }

    impl Message for TenantEvent {
        fn name(&self) -> &'static str {
            "TenantEvent"
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TenantCount {
        events: u32,
    }

    impl Projection for TenantCount {
        type Event = TenantEvent;

        fn type_name() -> &'static str {
            "tenant-count"
        }

        fn handled_event_types() -> &'static [&'static str] {
            &["TenantEvent"]
        }

        fn apply(&mut self, _stream_id: &str, _event: Self::Event) {
            self.events += 1;
        }
    }

    fn stored(version: Version, tenant: &str) -> StoredEvent {
        let event = TenantEvent { tenant: tenant.to_owned() };
        StoredEvent {
            stream_id: "tenants".into(),
            version,
            event_type: event.name().to_owned(),
            schema_version: 1,
            payload: serde_json::to_vec(&event).unwrap(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            external_sequencer: None,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn routes_events_to_per_tenant_destination_instances() {
        let store = InMemoryProjectionStore::default();
        let factory = Factory::<TenantCount, _, _>::new(store.clone(), Json::default());
        let entry = Entry::new("tenant-count", factory, |event: &TenantEvent| event.tenant.clone());

        let registry_store = InMemoryProjectionStore::default();
        let mut router = Router::load_or_create("tenant-router", "main", registry_store).await.unwrap();
        router.add_destination(Arc::new(entry));

        let events = vec![stored(0, "acme"), stored(1, "acme"), stored(2, "globex")];
        router.route("tenants", &events).await.unwrap();

        // Re-routing the same events must not double-apply them.
        router.route("tenants", &events).await.unwrap();

        let readback = Factory::<TenantCount, _, _>::new(store, Json::default());
        let (acme, _) = readback.get_or_create("acme").await.unwrap();
        let (globex, _) = readback.get_or_create("globex").await.unwrap();
        assert_eq!(acme.events, 2);
        assert_eq!(globex.events, 1);

        // The destination registry durably records both instances created
        // while routing.
        assert!(router.registry_entry("tenant-count:acme").await.is_some());
        assert!(router.registry_entry("tenant-count:globex").await.is_some());
    }

    #[tokio::test]
    async fn registry_survives_reloading_the_router() {
        let registry_store = InMemoryProjectionStore::default();

        {
            let factory = Factory::<TenantCount, _, _>::new(InMemoryProjectionStore::default(), Json::default());
            let entry = Entry::new("tenant-count", factory, |event: &TenantEvent| event.tenant.clone());

            let mut router = Router::load_or_create("tenant-router", "main", registry_store.clone()).await.unwrap();
            router.add_destination(Arc::new(entry));
            router.route("tenants", &[stored(0, "acme")]).await.unwrap();
        }

        // A fresh `Router` built over the same backing store (as would
        // happen after a process restart) still knows "acme" exists.
        let reloaded = Router::<InMemoryProjectionStore>::load_or_create("tenant-router", "main", registry_store).await.unwrap();
        let entry = reloaded.registry_entry("tenant-count:acme").await.expect("registry entry should persist");
        assert_eq!(entry.destination_type_name, "tenant-count");
        assert_eq!(entry.blob_path, "tenant-count/acme");
    }

    #[tokio::test]
    async fn create_destination_instance_bootstraps_without_events() {
        let factory = Factory::<TenantCount, _, _>::new(InMemoryProjectionStore::default(), Json::default());
        let entry = Arc::new(Entry::new("tenant-count", factory, |event: &TenantEvent| event.tenant.clone()));

        let mut router = Router::load_or_create("tenant-router", "main", InMemoryProjectionStore::default()).await.unwrap();
        router.add_destination(entry.clone());

        router.create_destination_instance("tenant-count", "acme").await.unwrap();
        assert!(entry.handle("tenants", &stored(0, "acme")).await.unwrap().is_some());
        assert!(router.registry_entry("tenant-count:acme").await.is_some());
    }

    #[tokio::test]
    async fn unknown_destination_name_is_not_found() {
        let router = Router::load_or_create("tenant-router", "main", InMemoryProjectionStore::default()).await.unwrap();
        let err = router
            .create_destination_instance("missing", "acme")
            .await
            .expect_err("should be not found");
        assert!(matches!(err, Error::NotFound));
    }
}
