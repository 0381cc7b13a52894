//! Given/When/Then test harness for aggregates.
//!
//! Given a prior event history, runs a closure over a session and asserts
//! the recorded events or the error: `when` takes a closure over a
//! [`crate::stream::Session`] directly, since this crate has no separate
//! command-dispatch layer.

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregate::{default_stream_type, Aggregate};
use crate::codec::Json;
use crate::config::EngineConfig;
use crate::document::InMemory as InMemoryDocumentStore;
use crate::event::store::{clear_closed_stream_cache, InMemory as InMemoryDataStore};
use crate::message::Message;
use crate::snapshot::InMemory as InMemorySnapshotStore;
use crate::stream::{Handle, Session, SessionError};

const SCENARIO_OBJECT_ID: &str = "scenario";

/// Entry point for building an aggregate scenario via `given`/`when`.
pub struct AggregateScenario;

impl AggregateScenario {
    /// Starts a scenario with no prior history; the first events appended
    /// by `when`'s body are the aggregate's entire history.
    pub fn when<A, F>(body: F) -> When<A, F>
    where
        A: Aggregate,
    {
        When { given: Vec::new(), body }
    }

    /// Starts a scenario whose aggregate already has `events` in its
    /// history before `when` runs.
    pub fn given<A>(events: Vec<A::Event>) -> Given<A>
    where
        A: Aggregate,
    {
        Given { events }
    }
}

/// The `given` stage: a prior event history, not yet paired with a `when`.
pub struct Given<A: Aggregate> {
    events: Vec<A::Event>,
}

impl<A: Aggregate> Given<A> {
    /// Pairs this history with the session `body` under test.
    pub fn when<F>(self, body: F) -> When<A, F> {
        When { given: self.events, body }
    }
}

/// The `when` stage: a prior history plus the session body under test, not
/// yet paired with an expectation.
pub struct When<A: Aggregate, F> {
    given: Vec<A::Event>,
    body: F,
}

impl<A, F, T, E> When<A, F>
where
    A: Aggregate,
    F: FnOnce(&Option<A>, &mut Session<A::Event>) -> Result<T, E>,
{
    /// Expects `body` to commit successfully, appending exactly `expected`
    /// events.
    pub fn then(self, expected: Vec<A::Event>) -> Then<A, F, T, E> {
        Then {
            given: self.given,
            body: self.body,
            expectation: Expectation::Events(expected),
            _result: std::marker::PhantomData,
        }
    }

    /// Expects `body` itself to return `err` (never reaching commit).
    pub fn then_error(self, err: E) -> Then<A, F, T, E> {
        Then {
            given: self.given,
            body: self.body,
            expectation: Expectation::Error(err),
            _result: std::marker::PhantomData,
        }
    }
}

enum Expectation<A: Aggregate, E> {
    Events(Vec<A::Event>),
    Error(E),
}

/// The fully-specified scenario, ready to run against a fresh in-memory
/// [`Handle`].
pub struct Then<A: Aggregate, F, T, E> {
    given: Vec<A::Event>,
    body: F,
    expectation: Expectation<A, E>,
    _result: std::marker::PhantomData<fn() -> T>,
}

impl<A, F, T, E> Then<A, F, T, E>
where
    A: Aggregate,
    A::Event: Message + Clone + Serialize + DeserializeOwned + PartialEq + Debug,
    F: FnOnce(&Option<A>, &mut Session<A::Event>) -> Result<T, E>,
    E: Debug + PartialEq,
{
    /// Runs the scenario against a fresh in-memory [`Handle`], asserting the
    /// recorded outcome matches the expectation built by `then`/`then_error`.
    ///
    /// Clears the process-global closed-stream cache first: an
    /// earlier scenario run in the same test binary must not leak a closed
    /// stream id into this one.
    pub async fn assert(self) {
        clear_closed_stream_cache();

        let handle: Handle<Json<A::Event>> = Handle::new(
            Arc::new(InMemoryDataStore::default()),
            Arc::new(InMemoryDocumentStore::default()),
            Arc::new(InMemorySnapshotStore::default()),
            Json::default(),
            EngineConfig::default(),
        );

        let document = handle
            .get_or_create(A::type_name(), SCENARIO_OBJECT_ID, &default_stream_type::<A>())
            .await
            .expect("scenario setup should provision a fresh document");

        let document = if self.given.is_empty() {
            document
        } else {
            let given = self.given.clone();
            let (document, ()) = handle
                .session::<A::Event, _, (), std::convert::Infallible>(document, move |session| {
                    for event in given {
                        session.append(event, &Json::default());
                    }
                    Ok(())
                })
                .await
                .expect("given history should commit cleanly");
            document
        };

        let state = if document.active.current_stream_version < 0 {
            None
        } else {
            Some(handle.fold::<A>(&document).await.expect("given history should fold"))
        };

        let body = self.body;
        let result = handle
            .session::<A::Event, _, (T, Vec<A::Event>), E>(document, move |session| {
                let outcome = body(&state, session)?;
                let recorded = session.uncommitted().cloned().collect();
                Ok((outcome, recorded))
            })
            .await;

        match (result, self.expectation) {
            (Ok((_, (_, recorded))), Expectation::Events(expected)) => {
                assert_eq!(recorded, expected, "recorded events did not match the scenario's `then` expectation");
            }
            (Err(SessionError::Body(actual)), Expectation::Error(expected)) => {
                assert_eq!(actual, expected, "body error did not match the scenario's `then_error` expectation");
            }
            (Ok(_), Expectation::Error(expected)) => {
                panic!("expected body to fail with {expected:?}, but the session committed successfully");
            }
            (Err(err), Expectation::Events(expected)) => {
                panic!("expected events {expected:?}, but the session failed instead: {err:?}");
            }
            (Err(SessionError::Commit(err)), Expectation::Error(expected)) => {
                panic!("expected body to fail with {expected:?}, but the session instead failed to commit: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum AccountEvent {
        Opened { initial: i64 },
        Withdrawn { amount: i64 },
    }

    impl Message for AccountEvent {
        fn name(&self) -> &'static str {
            match self {
                AccountEvent::Opened { .. } => "Opened",
                AccountEvent::Withdrawn { .. } => "Withdrawn",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Account {
        balance: i64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    enum AccountError {
        #[error("insufficient funds")]
        InsufficientFunds,
    }

    impl Aggregate for Account {
        type Event = AccountEvent;
        type Error = AccountError;

        fn type_name() -> &'static str {
            "account"
        }

        fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error> {
            let balance = state.map_or(0, |s| s.balance);
            match event {
                AccountEvent::Opened { initial } => Ok(Account { balance: initial }),
                AccountEvent::Withdrawn { amount } if amount <= balance => Ok(Account { balance: balance - amount }),
                AccountEvent::Withdrawn { .. } => Err(AccountError::InsufficientFunds),
            }
        }
    }

    #[tokio::test]
    async fn withdrawal_within_balance_is_recorded() {
        AggregateScenario::given::<Account>(vec![AccountEvent::Opened { initial: 100 }])
            .when(|state, session| {
                let balance = state.as_ref().map_or(0, |s| s.balance);
                if 40 > balance {
                    return Err(AccountError::InsufficientFunds);
                }
                session.append(AccountEvent::Withdrawn { amount: 40 }, &Json::default());
                Ok(())
            })
            .then(vec![AccountEvent::Withdrawn { amount: 40 }])
            .assert()
            .await;
    }

    #[tokio::test]
    async fn withdrawal_beyond_balance_is_rejected() {
        AggregateScenario::given::<Account>(vec![AccountEvent::Opened { initial: 10 }])
            .when(|state, _session| {
                let balance = state.as_ref().map_or(0, |s| s.balance);
                if 999 > balance {
                    return Err(AccountError::InsufficientFunds);
                }
                Ok(())
            })
            .then_error(AccountError::InsufficientFunds)
            .assert()
            .await;
    }
}
