//! The Projection Status Coordinator (C9): a small state machine tracking
//! each projection instance's rebuild lifecycle, guarded by CAS so two
//! concurrent rebuild triggers can't both "win".
//!
//! Modeled after the same CAS-on-a-hash-chain idiom [`crate::document`]
//! already established, substituting a short-lived nonce token for the
//! document's hash chain since a rebuild additionally needs a lease that
//! can expire.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A projection instance's position in its rebuild lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusValue {
    /// Serving live traffic, folding new events as they arrive.
    Active,
    /// A rebuild has been triggered; historical events are being replayed
    /// from scratch.
    Rebuilding,
    /// The historical replay has finished; now folding the events committed
    /// while the rebuild was running.
    CatchingUp,
    /// Caught up to the live edge; one more step promotes it to [`StatusValue::Active`].
    Ready,
    /// The rebuild failed, or its lease expired before completion.
    Failed,
    /// Administratively taken off live traffic; does not fold new events.
    Disabled,
}

/// A capability token proving ownership of an in-progress rebuild; every
/// state transition out of [`StatusValue::Rebuilding`] or
/// [`StatusValue::CatchingUp`] must present the matching, unexpired token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildToken {
    /// Unique per rebuild attempt; never reused.
    pub nonce: String,
    /// The lease expires at this instant; [`Coordinator::recover_stuck_rebuilds`]
    /// reclaims any rebuild whose token has expired.
    pub expires_at: DateTime<Utc>,
}

/// The persisted status of one projection instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// The projection type this record tracks.
    pub type_name: String,
    /// The projection instance id.
    pub id: String,
    /// Current lifecycle state.
    pub status: StatusValue,
    /// Present only while `status` is [`StatusValue::Rebuilding`] or
    /// [`StatusValue::CatchingUp`].
    pub rebuild_token: Option<RebuildToken>,
    /// Set when `status` transitions to [`StatusValue::Failed`].
    pub failure_reason: Option<String>,
    /// Last time this record changed.
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    fn fresh(type_name: &str, id: &str) -> Self {
        Self {
            type_name: type_name.to_owned(),
            id: id.to_owned(),
            status: StatusValue::Active,
            rebuild_token: None,
            failure_reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// Errors surfaced by the Projection Status Coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested transition is not legal from the record's current
    /// state (e.g. `mark_ready` called while `Active`).
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// The state the record was actually in.
        from: StatusValue,
        /// The state the caller tried to move it to.
        to: StatusValue,
    },

    /// The caller's rebuild token doesn't match the record's current one, or
    /// has expired.
    #[error("rebuild token is stale or expired")]
    StaleToken,

    /// The backend reported an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),
}

/// Storage contract for [`StatusRecord`]s.
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    /// Loads the record for `(type_name, id)`, creating (and persisting) a
    /// fresh [`StatusValue::Active`] record on first access.
    async fn get_or_create(&self, type_name: &str, id: &str) -> Result<StatusRecord, Error>;

    /// Writes `record` unconditionally; callers are expected to have
    /// validated the transition themselves (see [`Coordinator`]).
    async fn put(&self, record: StatusRecord) -> Result<(), Error>;

    /// Lists every record of `type_name` currently in `status`.
    async fn list_by_status(&self, type_name: &str, status: StatusValue) -> Result<Vec<StatusRecord>, Error>;
}

#[derive(Debug, Default)]
struct Backend {
    records: HashMap<(String, String), StatusRecord>,
}

/// In-memory reference implementation of [`StatusStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
}

#[async_trait::async_trait]
impl StatusStore for InMemory {
    async fn get_or_create(&self, type_name: &str, id: &str) -> Result<StatusRecord, Error> {
        let mut backend = self.backend.write().await;
        let key = (type_name.to_owned(), id.to_owned());
        Ok(backend.records.entry(key).or_insert_with(|| StatusRecord::fresh(type_name, id)).clone())
    }

    async fn put(&self, record: StatusRecord) -> Result<(), Error> {
        let mut backend = self.backend.write().await;
        backend.records.insert((record.type_name.clone(), record.id.clone()), record);
        Ok(())
    }

    async fn list_by_status(&self, type_name: &str, status: StatusValue) -> Result<Vec<StatusRecord>, Error> {
        let backend = self.backend.read().await;
        Ok(backend
            .records
            .values()
            .filter(|r| r.type_name == type_name && r.status == status)
            .cloned()
            .collect())
    }
}

/// Default lease duration granted to a rebuild attempt before it is
/// considered stuck.
pub const DEFAULT_REBUILD_LEASE_SECONDS: i64 = 300;

/// Drives [`StatusRecord`] transitions through the rebuild lifecycle,
/// rejecting any move the state machine doesn't allow.
pub struct Coordinator<S> {
    store: S,
    lease: ChronoDuration,
}

impl<S: StatusStore> Coordinator<S> {
    /// Builds a [`Coordinator`] with the default rebuild lease.
    pub fn new(store: S) -> Self {
        Self {
            store,
            lease: ChronoDuration::seconds(DEFAULT_REBUILD_LEASE_SECONDS),
        }
    }

    /// Builds a [`Coordinator`] with a custom rebuild lease duration.
    pub fn with_lease(store: S, lease: ChronoDuration) -> Self {
        Self { store, lease }
    }

    /// Returns the current status for `(type_name, id)`.
    pub async fn get_status(&self, type_name: &str, id: &str) -> Result<StatusRecord, Error> {
        self.store.get_or_create(type_name, id).await
    }

    /// Lists every instance of `type_name` currently in `status`.
    pub async fn get_by_status(&self, type_name: &str, status: StatusValue) -> Result<Vec<StatusRecord>, Error> {
        self.store.list_by_status(type_name, status).await
    }

    /// `Active`/`Failed` -> `Rebuilding`, minting a fresh [`RebuildToken`].
    pub async fn start_rebuild(&self, type_name: &str, id: &str) -> Result<RebuildToken, Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.require(&record, &[StatusValue::Active, StatusValue::Failed], StatusValue::Rebuilding)?;

        let token = RebuildToken {
            nonce: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + self.lease,
        };

        record.status = StatusValue::Rebuilding;
        record.rebuild_token = Some(token.clone());
        record.failure_reason = None;
        record.updated_at = Utc::now();
        self.store.put(record).await?;

        Ok(token)
    }

    /// `Rebuilding` -> `CatchingUp`, renewing the lease on the same token.
    pub async fn start_catch_up(&self, type_name: &str, id: &str, token: &RebuildToken) -> Result<(), Error> {
        self.transition_with_token(type_name, id, token, StatusValue::Rebuilding, StatusValue::CatchingUp, true)
            .await
    }

    /// `CatchingUp` -> `Ready`.
    pub async fn mark_ready(&self, type_name: &str, id: &str, token: &RebuildToken) -> Result<(), Error> {
        self.transition_with_token(type_name, id, token, StatusValue::CatchingUp, StatusValue::Ready, false)
            .await
    }

    /// `Ready` -> `Active`, clearing the rebuild token.
    pub async fn complete_rebuild(&self, type_name: &str, id: &str, token: &RebuildToken) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.verify_token(&record, token)?;
        self.require(&record, &[StatusValue::Ready], StatusValue::Active)?;

        record.status = StatusValue::Active;
        record.rebuild_token = None;
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    /// `Rebuilding`/`CatchingUp` -> `Active`, abandoning the rebuild without
    /// marking it failed (a voluntary stop, not an error).
    pub async fn cancel_rebuild(&self, type_name: &str, id: &str, token: &RebuildToken) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.verify_token(&record, token)?;
        self.require(&record, &[StatusValue::Rebuilding, StatusValue::CatchingUp], StatusValue::Active)?;

        record.status = StatusValue::Active;
        record.rebuild_token = None;
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    /// `Rebuilding`/`CatchingUp` -> `Failed`.
    pub async fn mark_failed(&self, type_name: &str, id: &str, token: &RebuildToken, reason: impl Into<String>) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.verify_token(&record, token)?;
        self.require(&record, &[StatusValue::Rebuilding, StatusValue::CatchingUp], StatusValue::Failed)?;

        record.status = StatusValue::Failed;
        record.rebuild_token = None;
        record.failure_reason = Some(reason.into());
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    /// `Active` -> `Disabled`.
    pub async fn disable(&self, type_name: &str, id: &str) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.require(&record, &[StatusValue::Active], StatusValue::Disabled)?;
        record.status = StatusValue::Disabled;
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    /// `Disabled` -> `Active`.
    pub async fn enable(&self, type_name: &str, id: &str) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.require(&record, &[StatusValue::Disabled], StatusValue::Active)?;
        record.status = StatusValue::Active;
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    /// Scans every `Rebuilding`/`CatchingUp` instance of `type_name` whose
    /// token has expired and marks it `Failed`. Returns the ids recovered.
    pub async fn recover_stuck_rebuilds(&self, type_name: &str) -> Result<Vec<String>, Error> {
        let mut recovered = Vec::new();
        let now = Utc::now();

        for status in [StatusValue::Rebuilding, StatusValue::CatchingUp] {
            for mut record in self.store.list_by_status(type_name, status).await? {
                let expired = record.rebuild_token.as_ref().is_some_and(|t| t.expires_at <= now);
                if !expired {
                    continue;
                }

                recovered.push(record.id.clone());
                record.status = StatusValue::Failed;
                record.rebuild_token = None;
                record.failure_reason = Some("rebuild lease expired".to_owned());
                record.updated_at = now;
                self.store.put(record).await?;
            }
        }

        Ok(recovered)
    }

    async fn transition_with_token(
        &self,
        type_name: &str,
        id: &str,
        token: &RebuildToken,
        from: StatusValue,
        to: StatusValue,
        renew_lease: bool,
    ) -> Result<(), Error> {
        let mut record = self.store.get_or_create(type_name, id).await?;
        self.verify_token(&record, token)?;
        self.require(&record, &[from], to)?;

        record.status = to;
        if renew_lease {
            record.rebuild_token = Some(RebuildToken {
                nonce: token.nonce.clone(),
                expires_at: Utc::now() + self.lease,
            });
        }
        record.updated_at = Utc::now();
        self.store.put(record).await?;
        Ok(())
    }

    fn require(&self, record: &StatusRecord, allowed_from: &[StatusValue], to: StatusValue) -> Result<(), Error> {
        if allowed_from.contains(&record.status) {
            Ok(())
        } else {
            Err(Error::IllegalTransition { from: record.status, to })
        }
    }

    fn verify_token(&self, record: &StatusRecord, token: &RebuildToken) -> Result<(), Error> {
        match &record.rebuild_token {
            Some(current) if current.nonce == token.nonce && current.expires_at > Utc::now() => Ok(()),
            _ => Err(Error::StaleToken),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn full_rebuild_lifecycle_reaches_active() {
        let coordinator = Coordinator::new(InMemory::default());

        let token = coordinator.start_rebuild("order-counts", "global").await.unwrap();
        assert_eq!(
            coordinator.get_status("order-counts", "global").await.unwrap().status,
            StatusValue::Rebuilding
        );

        coordinator.start_catch_up("order-counts", "global", &token).await.unwrap();
        coordinator.mark_ready("order-counts", "global", &token).await.unwrap();
        coordinator.complete_rebuild("order-counts", "global", &token).await.unwrap();

        let record = coordinator.get_status("order-counts", "global").await.unwrap();
        assert_eq!(record.status, StatusValue::Active);
        assert!(record.rebuild_token.is_none());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let coordinator = Coordinator::new(InMemory::default());
        let token = RebuildToken {
            nonce: "bogus".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        };

        let err = coordinator
            .mark_ready("order-counts", "global", &token)
            .await
            .expect_err("cannot mark ready from Active");
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn stale_token_is_rejected() {
        let coordinator = Coordinator::new(InMemory::default());
        coordinator.start_rebuild("order-counts", "global").await.unwrap();

        let wrong_token = RebuildToken {
            nonce: "not-the-real-one".into(),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        };

        let err = coordinator
            .start_catch_up("order-counts", "global", &wrong_token)
            .await
            .expect_err("token mismatch should be rejected");
        assert!(matches!(err, Error::StaleToken));
    }

    #[tokio::test]
    async fn recover_stuck_rebuilds_fails_expired_leases() {
        let coordinator = Coordinator::with_lease(InMemory::default(), ChronoDuration::seconds(-1));
        coordinator.start_rebuild("order-counts", "global").await.unwrap();

        let recovered = coordinator.recover_stuck_rebuilds("order-counts").await.unwrap();
        assert_eq!(recovered, vec!["global".to_string()]);

        let record = coordinator.get_status("order-counts", "global").await.unwrap();
        assert_eq!(record.status, StatusValue::Failed);
    }

    #[tokio::test]
    async fn disable_then_enable_round_trips() {
        let coordinator = Coordinator::new(InMemory::default());
        coordinator.disable("order-counts", "global").await.unwrap();
        assert_eq!(
            coordinator.get_status("order-counts", "global").await.unwrap().status,
            StatusValue::Disabled
        );

        coordinator.enable("order-counts", "global").await.unwrap();
        assert_eq!(
            coordinator.get_status("order-counts", "global").await.unwrap().status,
            StatusValue::Active
        );
    }
}
