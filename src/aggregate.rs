//! The Aggregate Fold Runtime (C6): binds a domain state type to its event
//! type and a single `objectName`, and provides `get`/`create`/`get_or_create`
//! factory methods over a [`crate::stream::Handle`].
//!
//! Folds via an `apply(state, event) -> Result<state, error>` trait method,
//! rehydrating through `Option<Self>` so the first event can double as a
//! constructor, generalized to the document-backed stream model this crate
//! uses instead of a bare event store.

use std::marker::PhantomData;

use crate::codec::Codec;
use crate::document::ObjectDocument;
use crate::message::Message;
use crate::stream::{CommitError, FoldError, Handle, Session};

/// A domain aggregate: a state type that folds over its own event type.
///
/// Folds directly into `Self` rather than a separate state type:
/// rehydration passes `Option<Self>`, where `None` means "no prior state",
/// letting the first event double as a constructor.
pub trait Aggregate: Sized + Send + Sync {
    /// The domain event type this aggregate folds over.
    type Event: Message + Clone + Send + Sync;

    /// Error raised when an event cannot be applied to the current state
    /// (e.g. a stored event from a schema this build no longer understands).
    type Error: std::error::Error + Send + Sync + 'static;

    /// The lowercase `objectName` every instance of this aggregate shares.
    fn type_name() -> &'static str;

    /// Folds `event` onto `state`, producing the next state. `state` is
    /// `None` only on the very first event a fresh aggregate instance ever
    /// receives.
    fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error>;
}

/// Errors surfaced by [`Factory`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error<AggErr> {
    /// No aggregate instance exists for the requested id.
    #[error("aggregate not found")]
    NotFound,

    /// An instance already exists where [`Factory::create`] expected none.
    #[error("aggregate already exists")]
    AlreadyExists,

    /// The aggregate rejected an event during replay or during the session.
    #[error(transparent)]
    Apply(AggErr),

    /// The Document Store returned an error.
    #[error(transparent)]
    Document(#[from] crate::document::Error),

    /// The commit protocol failed.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// A stored event payload could not be decoded.
    #[error("failed to decode event payload")]
    Decode,

    /// The Data Store or Snapshot Store returned an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),

    /// The Snapshot Store returned an error.
    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::Error),
}

impl<AggErr> From<FoldError<AggErr>> for Error<AggErr>
where
    AggErr: std::error::Error + Send + Sync + 'static,
{
    fn from(err: FoldError<AggErr>) -> Self {
        match err {
            FoldError::NotFound => Error::NotFound,
            FoldError::Apply(err) => Error::Apply(err),
            FoldError::Decode => Error::Decode,
            FoldError::Document(err) => Error::Document(err),
            FoldError::Backend(err) => Error::Backend(err),
            FoldError::Snapshot(err) => Error::Snapshot(err),
        }
    }
}

/// Stream type tag this crate stamps on every document backing an aggregate
/// of type `A`, unless the caller supplies its own.
pub(crate) fn default_stream_type<A: Aggregate>() -> String {
    format!("{}-stream", A::type_name())
}

/// Ties an [`Aggregate`] to a [`Handle`], exposing `get`/`create`/
/// `get_or_create` factory methods.
///
/// `get_or_create` is the common case: load the current state if the
/// instance exists, or hand the caller a blank slate (`None`) to build from,
/// all behind one document lookup.
pub struct Factory<A, C> {
    handle: Handle<C>,
    _aggregate: PhantomData<A>,
}

impl<A, C> Factory<A, C>
where
    A: Aggregate,
    C: Codec<A::Event>,
{
    /// Builds a [`Factory`] for aggregate type `A` over the given [`Handle`].
    pub fn new(handle: Handle<C>) -> Self {
        Self {
            handle,
            _aggregate: PhantomData,
        }
    }

    /// Loads the current state of an existing instance, failing with
    /// [`Error::NotFound`] if none exists yet.
    pub async fn get(&self, object_id: &str) -> Result<(ObjectDocument, A), Error<A::Error>> {
        let document = self
            .handle
            .get_or_create(A::type_name(), object_id, &default_stream_type::<A>())
            .await?;

        if document.active.current_stream_version < 0 {
            return Err(Error::NotFound);
        }

        let state = self.handle.fold::<A>(&document).await?;
        Ok((document, state))
    }

    /// Creates a brand-new instance, failing with [`Error::AlreadyExists`] if
    /// one is already on record.
    pub async fn create(&self, object_id: &str) -> Result<ObjectDocument, Error<A::Error>> {
        let existing = self
            .handle
            .get_or_create(A::type_name(), object_id, &default_stream_type::<A>())
            .await?;

        if existing.active.current_stream_version >= 0 {
            return Err(Error::AlreadyExists);
        }

        Ok(existing)
    }

    /// Loads the current state if present, or an empty document ready to
    /// receive its first event.
    pub async fn get_or_create(&self, object_id: &str) -> Result<(ObjectDocument, Option<A>), Error<A::Error>> {
        let document = self
            .handle
            .get_or_create(A::type_name(), object_id, &default_stream_type::<A>())
            .await?;

        if document.active.current_stream_version < 0 {
            return Ok((document, None));
        }

        let state = self.handle.fold::<A>(&document).await?;
        Ok((document, Some(state)))
    }

    /// Runs a write session against `document`, folding each recorded event
    /// onto `state` as it is appended so the caller's command-handling code
    /// sees the post-event state without a second round-trip, then commits.
    ///
    /// `body` receives the pre-session state (`None` for a fresh instance)
    /// and the [`Session`] to append to; its return value passes through.
    pub async fn session<F, T>(
        &self,
        document: ObjectDocument,
        state: Option<A>,
        body: F,
    ) -> Result<(ObjectDocument, Option<A>, T), Error<A::Error>>
    where
        F: FnOnce(&Option<A>, &mut Session<A::Event>) -> Result<T, A::Error>,
    {
        let mut folded = state;
        let mut result = None;

        let (document, ()) = self
            .handle
            .session::<A::Event, _, _, A::Error>(document, |session| {
                let outcome = body(&folded, session)?;
                for event in session.uncommitted().cloned().collect::<Vec<_>>() {
                    folded = Some(A::apply(folded.take(), event)?);
                }
                result = Some(outcome);
                Ok(())
            })
            .await
            .map_err(|err| match err {
                crate::stream::SessionError::Body(err) => Error::Apply(err),
                crate::stream::SessionError::Commit(err) => Error::Commit(err),
            })?;

        if let Some(state) = &folded {
            if let Err(err) = self.handle.snapshot_if_due(&document, state).await {
                crate::stream::tracing_log_snapshot_failure(&err);
            }
        }

        Ok((document, folded, result.expect("body always runs before commit")))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::codec::Json;
    use crate::config::EngineConfig;
    use crate::document::InMemory as InMemoryDocumentStore;
    use crate::event::store::{clear_closed_stream_cache, InMemory as InMemoryDataStore};
    use crate::snapshot::InMemory as InMemorySnapshotStore;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum BalanceEvent {
        Opened { initial: i64 },
        Deposited { amount: i64 },
    }

    impl Message for BalanceEvent {
        fn name(&self) -> &'static str {
            match self {
                BalanceEvent::Opened { .. } => "Opened",
                BalanceEvent::Deposited { .. } => "Deposited",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Balance {
        value: i64,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("cannot deposit before the account is opened")]
    struct NotOpened;

    impl Aggregate for Balance {
        type Event = BalanceEvent;
        type Error = NotOpened;

        fn type_name() -> &'static str {
            "balance"
        }

        fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error> {
            match (state, event) {
                (None, BalanceEvent::Opened { initial }) => Ok(Balance { value: initial }),
                (None, BalanceEvent::Deposited { .. }) => Err(NotOpened),
                (Some(balance), BalanceEvent::Deposited { amount }) => Ok(Balance {
                    value: balance.value + amount,
                }),
                (Some(balance), BalanceEvent::Opened { .. }) => Ok(balance),
            }
        }
    }

    fn factory() -> Factory<Balance, Json<BalanceEvent>> {
        clear_closed_stream_cache();
        let handle = Handle::new(
            Arc::new(InMemoryDataStore::default()),
            Arc::new(InMemoryDocumentStore::default()),
            Arc::new(InMemorySnapshotStore::default()),
            Json::default(),
            EngineConfig::default(),
        );
        Factory::new(handle)
    }

    #[tokio::test]
    async fn get_or_create_then_session_builds_up_state() {
        let factory = factory();

        let (document, state) = factory.get_or_create("acc-1").await.expect("lookup should succeed");
        assert!(state.is_none());

        let (document, state, ()) = factory
            .session(document, state, |_, session| {
                session.append(BalanceEvent::Opened { initial: 100 }, &Json::default());
                Ok(())
            })
            .await
            .expect("session should commit");

        assert_eq!(state.as_ref().unwrap().value, 100);

        let (_, state, ()) = factory
            .session(document, state, |_, session| {
                session.append(BalanceEvent::Deposited { amount: 25 }, &Json::default());
                Ok(())
            })
            .await
            .expect("second session should commit");

        assert_eq!(state.unwrap().value, 125);
    }

    #[tokio::test]
    async fn get_on_missing_instance_is_not_found() {
        let factory = factory();
        let err = factory.get("missing").await.expect_err("should not be found");
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let factory = factory();
        let document = factory.create("acc-2").await.expect("first create should succeed");

        let (document, _, ()) = factory
            .session(document, None, |_, session| {
                session.append(BalanceEvent::Opened { initial: 10 }, &Json::default());
                Ok(())
            })
            .await
            .unwrap();
        let _ = document;

        let err = factory.create("acc-2").await.expect_err("second create should be rejected");
        assert!(matches!(err, Error::AlreadyExists));
    }
}
