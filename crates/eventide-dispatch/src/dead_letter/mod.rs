//! Dead-letter queue.
//!
//! The queue is the last-resort record of deliveries that failed for good:
//! retries exhausted, undecodable or invalid events, open circuits. Entries
//! keep the original event so they can be replayed once the cause is fixed.

mod admin;
mod store;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide_core::clock::SharedClock;
use eventide_core::event::RecordedEvent;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use admin::{AdminOutcome, DeadLetterAdmin, EXIT_FAILURE, EXIT_OK};
pub use store::{DeadLetterStore, FileDeadLetterStore, InMemoryDeadLetterStore};

use crate::error::{DeadLetterError, DeliveryError};

/// Default replay attempts before an entry is marked `MaxRetriesExceeded`.
pub const DEFAULT_MAX_REPLAY_ATTEMPTS: u32 = 5;

/// Why an event was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Replay gave up on the entry.
    MaxRetriesExceeded,
    /// The event could not be decoded.
    DeserializationError,
    /// The handler kept failing.
    HandlerError,
    /// The event was rejected by validation.
    ValidationError,
    /// Anything else, such as an open circuit.
    Unknown,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MaxRetriesExceeded => "MaxRetriesExceeded",
            Self::DeserializationError => "DeserializationError",
            Self::HandlerError => "HandlerError",
            Self::ValidationError => "ValidationError",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl DeadLetterReason {
    /// Classifies a final delivery failure.
    #[must_use]
    pub fn for_delivery_error(err: &DeliveryError) -> Self {
        use crate::error::HandlerError;
        match err {
            DeliveryError::Handler(HandlerError::Failed(_)) => Self::HandlerError,
            DeliveryError::Handler(HandlerError::Deserialization(_)) => Self::DeserializationError,
            DeliveryError::Handler(HandlerError::Validation(_)) => Self::ValidationError,
            _ => Self::Unknown,
        }
    }
}

/// A queued failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Entry id.
    pub id: Uuid,
    /// Discriminator of the failed event.
    pub event_type: String,
    /// The original event, or a best-effort dump of it.
    pub payload: serde_json::Value,
    /// Failure classification.
    pub reason: DeadLetterReason,
    /// Error tag, such as `HandlerError` or `CircuitOpen`.
    pub error_type: String,
    /// Last error message.
    pub error_message: String,
    /// Subscription the delivery was for, if any.
    pub subscription_id: Option<Uuid>,
    /// Handler invocations and replay attempts so far.
    pub attempt_count: u32,
    /// When the entry was queued.
    pub created_at: DateTime<Utc>,
    /// When the entry was last attempted.
    pub last_attempt_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    /// First eight hex digits of the id, as shown by the admin surface.
    #[must_use]
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_owned()
    }

    /// Decodes the original event.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the payload is not a recorded event.
    pub fn original_event(&self) -> Result<RecordedEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Failure details passed to [`DeadLetterQueue::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFailure {
    /// Failure classification.
    pub reason: DeadLetterReason,
    /// Error tag.
    pub error_type: String,
    /// Error message.
    pub error_message: String,
    /// Subscription the delivery was for.
    pub subscription_id: Option<Uuid>,
    /// Handler invocations so far.
    pub attempt_count: u32,
}

impl DeadLetterFailure {
    /// Describes a failed delivery to `subscription_id`.
    #[must_use]
    pub fn from_delivery(err: &DeliveryError, subscription_id: Uuid, attempt_count: u32) -> Self {
        Self {
            reason: DeadLetterReason::for_delivery_error(err),
            error_type: err.kind().to_owned(),
            error_message: err.to_string(),
            subscription_id: Some(subscription_id),
            attempt_count,
        }
    }
}

/// Redelivers dead-lettered events.
#[async_trait]
pub trait DeadLetterReplayer: Send + Sync {
    /// Delivers `event` again, to `subscription_id` if given or to every
    /// matching subscription otherwise.
    async fn replay(&self, subscription_id: Option<Uuid>, event: &RecordedEvent) -> Result<(), DeliveryError>;
}

/// Progress callback argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayProgress {
    /// Entries finished so far.
    pub processed: usize,
    /// Entries scheduled in this replay.
    pub total: usize,
    /// Entries replayed and removed.
    pub succeeded: usize,
    /// Entries that failed again.
    pub failed: usize,
}

type EntryFilter = Arc<dyn Fn(&DeadLetterEvent) -> bool + Send + Sync>;
type ProgressFn = Arc<dyn Fn(&ReplayProgress) + Send + Sync>;

/// Options for [`DeadLetterQueue::replay_events`].
#[derive(Clone)]
pub struct ReplayOptions {
    /// Entries replayed at once.
    pub max_concurrency: usize,
    /// Entries scheduled per batch; cancellation is checked between batches
    /// and while a batch runs.
    pub batch_size: usize,
    /// Only entries passing the filter are replayed.
    pub filter: Option<EntryFilter>,
    /// Called after each finished entry.
    pub progress: Option<ProgressFn>,
    /// Stops scheduling and abandons in-flight attempts when triggered.
    pub stop: CancellationToken,
    /// Also replay entries marked `MaxRetriesExceeded`.
    pub force: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_size: 50,
            filter: None,
            progress: None,
            stop: CancellationToken::new(),
            force: false,
        }
    }
}

impl Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("batch_size", &self.batch_size)
            .field("filter", &self.filter.is_some())
            .field("progress", &self.progress.is_some())
            .field("stop", &self.stop.is_cancelled())
            .field("force", &self.force)
            .finish()
    }
}

impl ReplayOptions {
    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&DeadLetterEvent) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(&ReplayProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Sets the stop signal.
    #[must_use]
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Includes entries marked `MaxRetriesExceeded`.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Summary of one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries scheduled.
    pub total: usize,
    /// Entries replayed and removed.
    pub succeeded: usize,
    /// Entries that failed again and stay queued.
    pub failed: usize,
    /// Entries left alone because they exceeded their replay attempts.
    pub skipped: usize,
    /// The run was stopped before finishing.
    pub cancelled: bool,
}

/// Result of replaying a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Delivered and removed from the queue.
    Replayed,
    /// Failed again; the entry stays queued with a new attempt count.
    Failed {
        /// Attempt count after this attempt.
        attempt_count: u32,
        /// The new error message.
        error: String,
    },
    /// Not attempted: the entry exceeded its replay attempts.
    Skipped,
}

struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Queue of failed deliveries over a [`DeadLetterStore`].
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    clock: SharedClock,
    max_replay_attempts: u32,
    replaying: AtomicBool,
}

impl Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("max_replay_attempts", &self.max_replay_attempts)
            .field("replaying", &self.is_replaying())
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    /// Creates a queue over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DeadLetterStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            max_replay_attempts: DEFAULT_MAX_REPLAY_ATTEMPTS,
            replaying: AtomicBool::new(false),
        }
    }

    /// Sets how many attempts an entry gets before it is marked
    /// `MaxRetriesExceeded` (at least 1).
    #[must_use]
    pub fn with_max_replay_attempts(mut self, attempts: u32) -> Self {
        self.max_replay_attempts = attempts.max(1);
        self
    }

    /// Returns `true` while a replay runs.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    /// Queues a failed delivery of `original`. Serialization of `original`
    /// never fails the call: values that do not serialize are stored as
    /// their `Debug` rendering.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` if the store cannot persist the
    /// entry.
    pub async fn add<T>(
        &self,
        original: &T,
        event_type: &str,
        failure: DeadLetterFailure,
    ) -> Result<DeadLetterEvent, DeadLetterError>
    where
        T: Serialize + Debug + ?Sized,
    {
        let payload = serde_json::to_value(original).unwrap_or_else(|e| {
            serde_json::json!({
                "unserializable": format!("{original:?}"),
                "serialization_error": e.to_string(),
            })
        });
        let now = self.clock.now();
        let entry = DeadLetterEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            payload,
            reason: failure.reason,
            error_type: failure.error_type,
            error_message: failure.error_message,
            subscription_id: failure.subscription_id,
            attempt_count: failure.attempt_count,
            created_at: now,
            last_attempt_at: now,
        };
        self.store.insert(entry.clone()).await?;
        tracing::warn!(
            dead_letter_id = %entry.id,
            event_type = %entry.event_type,
            reason = %entry.reason,
            subscription_id = ?entry.subscription_id,
            attempt_count = entry.attempt_count,
            error = %entry.error_message,
            "event dead-lettered"
        );
        Ok(entry)
    }

    /// Entries oldest first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` on store failure.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<DeadLetterEvent>, DeadLetterError> {
        let mut entries = self.store.list().await?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Number of queued entries.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` on store failure.
    pub async fn len(&self) -> Result<usize, DeadLetterError> {
        Ok(self.store.list().await?.len())
    }

    /// Returns `true` if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` on store failure.
    pub async fn is_empty(&self) -> Result<bool, DeadLetterError> {
        Ok(self.len().await? == 0)
    }

    /// Finds the single entry whose id starts with `prefix` (hex digits,
    /// hyphens ignored).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `AmbiguousPrefix`.
    pub async fn find(&self, prefix: &str) -> Result<DeadLetterEvent, DeadLetterError> {
        let wanted: String = prefix
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if wanted.is_empty() {
            return Err(DeadLetterError::NotFound(prefix.to_owned()));
        }
        let mut matches: Vec<DeadLetterEvent> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|e| e.id.simple().to_string().starts_with(&wanted))
            .collect();
        match matches.len() {
            0 => Err(DeadLetterError::NotFound(prefix.to_owned())),
            1 => Ok(matches.remove(0)),
            n => Err(DeadLetterError::AmbiguousPrefix {
                prefix: prefix.to_owned(),
                matches: n,
            }),
        }
    }

    /// Removes one entry. Returns `false` if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns `DeadLetterError::Storage` on store failure.
    pub async fn remove(&self, id: Uuid) -> Result<bool, DeadLetterError> {
        self.store.remove(id).await
    }

    /// Removes every entry, returning how many there were.
    ///
    /// # Errors
    ///
    /// Returns `ReplayInProgress` while a replay runs, or a storage error.
    pub async fn clear(&self) -> Result<usize, DeadLetterError> {
        let _guard = self.begin_replay()?;
        let cleared = self.store.clear().await?;
        tracing::info!(cleared, "dead-letter queue cleared");
        Ok(cleared)
    }

    /// Replays one entry by id prefix.
    ///
    /// # Errors
    ///
    /// Returns `ReplayInProgress`, `NotFound`, `AmbiguousPrefix` or a
    /// storage error. A failed redelivery is an `Ok(EntryOutcome::Failed)`.
    pub async fn retry(
        &self,
        replayer: &dyn DeadLetterReplayer,
        prefix: &str,
        force: bool,
    ) -> Result<EntryOutcome, DeadLetterError> {
        let _guard = self.begin_replay()?;
        let entry = self.find(prefix).await?;
        if entry.reason == DeadLetterReason::MaxRetriesExceeded && !force {
            return Ok(EntryOutcome::Skipped);
        }
        self.replay_entry(replayer, entry).await
    }

    /// Replays queued entries with bounded concurrency. Each finished
    /// attempt either removes its entry or bumps its attempt count, never
    /// both. Attempts abandoned by `stop` record nothing.
    ///
    /// # Errors
    ///
    /// Returns `ReplayInProgress` if another replay runs, or a storage
    /// error, which aborts the run.
    pub async fn replay_events(
        &self,
        replayer: &dyn DeadLetterReplayer,
        options: ReplayOptions,
    ) -> Result<ReplayReport, DeadLetterError> {
        let _guard = self.begin_replay()?;
        let mut report = ReplayReport::default();
        let mut queued = Vec::new();
        for entry in self.store.list().await? {
            if options.filter.as_ref().is_some_and(|keep| !keep(&entry)) {
                continue;
            }
            if entry.reason == DeadLetterReason::MaxRetriesExceeded && !options.force {
                report.skipped += 1;
                continue;
            }
            queued.push(entry);
        }
        report.total = queued.len();
        tracing::info!(
            total = report.total,
            skipped = report.skipped,
            max_concurrency = options.max_concurrency,
            "starting dead-letter replay"
        );

        'batches: for batch in queued.chunks(options.batch_size.max(1)) {
            if options.stop.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let mut attempts = std::pin::pin!(
                futures::stream::iter(batch.iter().cloned())
                    .map(|entry| self.replay_entry(replayer, entry))
                    .buffer_unordered(options.max_concurrency.max(1))
            );
            loop {
                tokio::select! {
                    biased;
                    () = options.stop.cancelled() => {
                        report.cancelled = true;
                        break 'batches;
                    }
                    next = attempts.next() => {
                        let Some(outcome) = next else { break };
                        match outcome? {
                            EntryOutcome::Replayed => report.succeeded += 1,
                            EntryOutcome::Failed { .. } => report.failed += 1,
                            EntryOutcome::Skipped => report.skipped += 1,
                        }
                        if let Some(progress) = &options.progress {
                            progress(&ReplayProgress {
                                processed: report.succeeded + report.failed,
                                total: report.total,
                                succeeded: report.succeeded,
                                failed: report.failed,
                            });
                        }
                    }
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "dead-letter replay finished"
        );
        Ok(report)
    }

    async fn replay_entry(
        &self,
        replayer: &dyn DeadLetterReplayer,
        mut entry: DeadLetterEvent,
    ) -> Result<EntryOutcome, DeadLetterError> {
        let delivered = match entry.original_event() {
            Ok(event) => replayer
                .replay(entry.subscription_id, &event)
                .await
                .map_err(|e| (e.kind().to_owned(), e.to_string())),
            Err(e) => Err(("DeserializationError".to_owned(), e.to_string())),
        };
        match delivered {
            Ok(()) => {
                self.store.remove(entry.id).await?;
                tracing::info!(dead_letter_id = %entry.id, "dead letter replayed");
                Ok(EntryOutcome::Replayed)
            }
            Err((error_type, error_message)) => {
                entry.attempt_count = entry.attempt_count.saturating_add(1);
                entry.last_attempt_at = self.clock.now();
                entry.error_type = error_type;
                entry.error_message.clone_from(&error_message);
                if entry.attempt_count >= self.max_replay_attempts {
                    entry.reason = DeadLetterReason::MaxRetriesExceeded;
                }
                self.store.update(&entry).await?;
                tracing::warn!(
                    dead_letter_id = %entry.id,
                    attempt_count = entry.attempt_count,
                    reason = %entry.reason,
                    error = %error_message,
                    "dead letter replay failed"
                );
                Ok(EntryOutcome::Failed {
                    attempt_count: entry.attempt_count,
                    error: error_message,
                })
            }
        }
    }

    fn begin_replay(&self) -> Result<ReplayGuard<'_>, DeadLetterError> {
        self.replaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DeadLetterError::ReplayInProgress)?;
        Ok(ReplayGuard(&self.replaying))
    }
}
