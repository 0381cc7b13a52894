//! The Live Migration Executor (C10): moves an aggregate's event history to
//! a new stream while it keeps taking writes, then atomically closes the old
//! stream and cuts its document over to the new one.
//!
//! The catch-up/close/sweep loop reuses the same primitives
//! [`crate::stream::Handle::commit`] does: [`crate::event::NewEvent::close_sentinel`]
//! for the atomic close, and the document hash-chain CAS retry from
//! [`crate::document`] for the cutover write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::document::{DocumentStore, ObjectDocument, StreamInformation, TerminatedStream};
use crate::event::store::{AppendError, DataStore};
use crate::event::{NewEvent, StreamClosed};
use crate::version::Version;

/// Errors surfaced by the Live Migration Executor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The catch-up loop never converged within the configured iteration
    /// budget -- the source stream is receiving writes faster than this
    /// executor can copy them.
    #[error("migration did not converge within {0} iterations")]
    MaxIterationsExceeded(u32),

    /// The document's CAS write kept losing to concurrent metadata updates
    /// during cutover.
    #[error("document cutover retries exhausted")]
    CutoverRetriesExhausted,

    /// The Data Store returned an error outside the conflict taxonomy.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// The Document Store returned an error.
    #[error(transparent)]
    Document(#[from] crate::document::Error),

    /// The backend reported an error.
    #[error(transparent)]
    Backend(#[from] crate::error::BackendError),
}

/// Summary of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Number of business events copied from the old stream to the new one.
    pub events_copied: usize,
    /// Identifier of the new, now-active stream.
    pub new_stream_id: String,
    /// `true` if this call found the migration already completed by a
    /// concurrent executor and performed no work.
    pub already_migrated: bool,
}

const MAX_DOCUMENT_RETRIES: u32 = 3;

/// Drives one aggregate's live migration from its current stream to a new
/// one.
pub struct Executor {
    data_store: Arc<dyn DataStore>,
    document_store: Arc<dyn DocumentStore>,
    max_iterations: u32,
    close_timeout: Duration,
}

impl Executor {
    /// Builds an [`Executor`] bounded by `max_iterations` catch-up rounds and
    /// an overall `close_timeout` wall-clock budget.
    pub fn new(data_store: Arc<dyn DataStore>, document_store: Arc<dyn DocumentStore>, max_iterations: u32, close_timeout: Duration) -> Self {
        Self {
            data_store,
            document_store,
            max_iterations,
            close_timeout,
        }
    }

    /// Migrates `document`'s active stream to `new_stream_id`, copying every
    /// business event across, atomically closing the old stream, sweeping up
    /// anything that landed in the race window right before the close, and
    /// cutting the document over.
    pub async fn migrate(
        &self,
        document: ObjectDocument,
        new_stream_id: impl Into<String>,
        new_stream_type: impl Into<String>,
        reason: impl Into<String>,
        migration_id: impl Into<String>,
    ) -> Result<(ObjectDocument, Outcome), Error> {
        let new_stream_id = new_stream_id.into();
        let new_stream_type = new_stream_type.into();
        let reason = reason.into();
        let migration_id = migration_id.into();

        if document.active.stream_identifier == new_stream_id {
            return Ok((
                document,
                Outcome {
                    events_copied: 0,
                    new_stream_id,
                    already_migrated: true,
                },
            ));
        }

        if document
            .terminated_streams
            .iter()
            .any(|t| t.continuation_stream_id.as_deref() == Some(new_stream_id.as_str()))
        {
            // A concurrent executor already completed this exact migration;
            // treat as a success with nothing left to do (B4).
            return Ok((
                document,
                Outcome {
                    events_copied: 0,
                    new_stream_id,
                    already_migrated: true,
                },
            ));
        }

        let old_stream_id = document.active.stream_identifier.clone();
        let mut last_copied: i64 = -1;
        let mut total_copied = 0usize;
        let deadline = tokio::time::Instant::now() + self.close_timeout;

        for _ in 0..self.max_iterations {
            let copied = self.copy_batch(&old_stream_id, &new_stream_id, last_copied).await?;

            if let Some(last) = copied.last_version {
                last_copied = last;
                total_copied += copied.count;
                // More events may already be queued behind the ones we just
                // copied; loop again immediately rather than attempting to
                // close.
                if tokio::time::Instant::now() < deadline {
                    continue;
                }
            }

            let swept = self
                .close_and_sweep(&document, &old_stream_id, &new_stream_id, &new_stream_type, &reason, &migration_id, last_copied)
                .await?;

            match swept {
                CloseOutcome::Closed { last_business_version } => {
                    let document = self
                        .cutover(document, &old_stream_id, &new_stream_id, &new_stream_type, &reason, last_business_version)
                        .await?;

                    return Ok((
                        document,
                        Outcome {
                            events_copied: total_copied,
                            new_stream_id,
                            already_migrated: false,
                        },
                    ));
                }
                CloseOutcome::MoreToCopy { up_to_version, copied: extra } => {
                    last_copied = up_to_version;
                    total_copied += extra;
                }
                CloseOutcome::AlreadyMigrated { document } => {
                    // A concurrent executor closed the source stream first
                    // (and may or may not have finished its own cutover yet);
                    // B4 only requires that at most one sentinel gets
                    // appended, so this call succeeds without writing one.
                    return Ok((
                        document,
                        Outcome {
                            events_copied: total_copied,
                            new_stream_id,
                            already_migrated: true,
                        },
                    ));
                }
            }
        }

        Err(Error::MaxIterationsExceeded(self.max_iterations))
    }

    async fn copy_batch(&self, old_stream_id: &str, new_stream_id: &str, after_version: i64) -> Result<CopyResult, Error> {
        let events = self
            .data_store
            .read(old_stream_id, (after_version + 1) as Version, None)
            .await?
            .unwrap_or_default();

        let business: Vec<_> = events.into_iter().filter(|e| !e.is_close_sentinel()).collect();

        if business.is_empty() {
            return Ok(CopyResult { last_version: None, count: 0 });
        }

        let last_version = business.last().map(|e| e.version as i64);
        let count = business.len();

        let to_copy: Vec<NewEvent> = business
            .into_iter()
            .map(|e| {
                let mut new_event = NewEvent::new(e.event_type, e.schema_version, e.payload);
                new_event.preserved_timestamp = Some(e.timestamp);
                new_event.correlation_id = e.correlation_id;
                new_event.causation_id = e.causation_id;
                new_event.external_sequencer = e.external_sequencer;
                new_event.ttl = e.ttl;
                new_event
            })
            .collect();

        self.data_store.append(new_stream_id, crate::version::Check::Any, true, to_copy).await?;

        Ok(CopyResult { last_version, count })
    }

    async fn close_and_sweep(
        &self,
        document: &ObjectDocument,
        old_stream_id: &str,
        new_stream_id: &str,
        new_stream_type: &str,
        reason: &str,
        migration_id: &str,
        last_copied: i64,
    ) -> Result<CloseOutcome, Error> {
        let payload = StreamClosed {
            continuation_stream_id: new_stream_id.to_owned(),
            continuation_stream_type: new_stream_type.to_owned(),
            continuation_data_store: None,
            continuation_document_store: None,
            reason: reason.to_owned(),
            closed_at: Utc::now(),
            migration_id: Some(migration_id.to_owned()),
            last_business_event_version: last_copied.max(0) as Version,
        };

        let sentinel_version = match self
            .data_store
            .append(old_stream_id, crate::version::Check::Any, false, vec![NewEvent::close_sentinel(&payload)])
            .await
        {
            Ok(version) => version,
            Err(AppendError::StreamClosed) => {
                // A concurrent migrator's sentinel beat ours. Re-read the
                // document rather than propagating the error: whatever state
                // it's in (already cut over, or not yet) is the other
                // executor's to finish, and B4 only asks that we not write a
                // second sentinel.
                let fresh = self
                    .document_store
                    .get(&document.object_name, &document.object_id)
                    .await?
                    .unwrap_or_else(|| document.clone());
                return Ok(CloseOutcome::AlreadyMigrated { document: fresh });
            }
            Err(err) => return Err(err.into()),
        };

        // Anything that landed between our last read and the sentinel now
        // sits at versions (last_copied+1 .. sentinel_version-1); sweep it
        // over before declaring the close final.
        if sentinel_version as i64 > last_copied + 1 {
            let gap_end = sentinel_version - 1;
            let gap = self
                .data_store
                .read(old_stream_id, (last_copied + 1) as Version, Some(gap_end))
                .await?
                .unwrap_or_default();

            let business: Vec<_> = gap.into_iter().filter(|e| !e.is_close_sentinel()).collect();

            if !business.is_empty() {
                let copied = business.len();
                let up_to_version = business.last().map(|e| e.version as i64).unwrap_or(last_copied);

                let to_copy: Vec<NewEvent> = business
                    .into_iter()
                    .map(|e| {
                        let mut new_event = NewEvent::new(e.event_type, e.schema_version, e.payload);
                        new_event.preserved_timestamp = Some(e.timestamp);
                        new_event.correlation_id = e.correlation_id;
                        new_event.causation_id = e.causation_id;
                        new_event.external_sequencer = e.external_sequencer;
                        new_event.ttl = e.ttl;
                        new_event
                    })
                    .collect();

                self.data_store.append(new_stream_id, crate::version::Check::Any, true, to_copy).await?;

                return Ok(CloseOutcome::MoreToCopy { up_to_version, copied });
            }
        }

        Ok(CloseOutcome::Closed {
            last_business_version: last_copied.max(0) as Version,
        })
    }

    async fn cutover(
        &self,
        mut document: ObjectDocument,
        old_stream_id: &str,
        new_stream_id: &str,
        new_stream_type: &str,
        reason: &str,
        last_business_version: Version,
    ) -> Result<ObjectDocument, Error> {
        let old_active = document.active.clone();

        document.terminated_streams.push(TerminatedStream {
            stream: StreamInformation {
                current_stream_version: last_business_version as i64,
                ..old_active
            },
            stream_version: last_business_version,
            reason: reason.to_owned(),
            continuation_stream_id: Some(new_stream_id.to_owned()),
            terminated_at: Utc::now(),
        });

        let new_version = self
            .data_store
            .read(new_stream_id, 0, None)
            .await?
            .and_then(|events| events.last().map(|e| e.version as i64))
            .unwrap_or(-1);

        let mut new_active = StreamInformation::new(new_stream_id, new_stream_type);
        new_active.current_stream_version = new_version;
        document.active = new_active;

        let _ = old_stream_id;

        let mut attempts = 0;
        loop {
            document.rehash();

            match self.document_store.set(document.clone(), true).await {
                Ok(()) => return Ok(document),
                Err(crate::document::Error::ConcurrencyConflict { .. }) if attempts < MAX_DOCUMENT_RETRIES => {
                    attempts += 1;
                    if let Some(fresh) = self.document_store.get(&document.object_name, &document.object_id).await? {
                        document = fresh;
                        document.active = StreamInformation {
                            current_stream_version: new_version,
                            ..StreamInformation::new(new_stream_id, new_stream_type)
                        };
                    }
                }
                Err(crate::document::Error::ConcurrencyConflict { .. }) => return Err(Error::CutoverRetriesExhausted),
                Err(err) => return Err(Error::Document(err)),
            }
        }
    }
}

struct CopyResult {
    last_version: Option<i64>,
    count: usize,
}

enum CloseOutcome {
    Closed { last_business_version: Version },
    MoreToCopy { up_to_version: i64, copied: usize },
    AlreadyMigrated { document: ObjectDocument },
}
