//! Operator commands over the dead-letter queue.
//!
//! Each command is a thin wrapper over [`DeadLetterQueue`] that renders
//! human-readable lines and an exit code: `0` for success or nothing to
//! do, `1` for operational failures. Argument parsing belongs to the
//! calling binary.

use std::sync::Arc;

use super::{DeadLetterEvent, DeadLetterQueue, DeadLetterReplayer, EntryOutcome, ReplayOptions};
use crate::error::DeadLetterError;

/// Exit code for success and no-ops.
pub const EXIT_OK: i32 = 0;
/// Exit code for operational failures.
pub const EXIT_FAILURE: i32 = 1;

/// Output of one admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminOutcome {
    /// Process exit code.
    pub exit_code: i32,
    /// Lines to print.
    pub lines: Vec<String>,
}

impl AdminOutcome {
    fn ok(lines: Vec<String>) -> Self {
        Self {
            exit_code: EXIT_OK,
            lines,
        }
    }

    fn failed(err: &DeadLetterError) -> Self {
        Self {
            exit_code: EXIT_FAILURE,
            lines: vec![format!("error: {err}")],
        }
    }

    fn refused(line: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_FAILURE,
            lines: vec![line.into()],
        }
    }

    /// Returns `true` if the command succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_OK
    }
}

/// The `list`, `show`, `retry`, `replay` and `clear` commands.
pub struct DeadLetterAdmin {
    queue: Arc<DeadLetterQueue>,
    replayer: Arc<dyn DeadLetterReplayer>,
    replay_defaults: ReplayOptions,
}

impl std::fmt::Debug for DeadLetterAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterAdmin")
            .field("queue", &self.queue)
            .field("replay_defaults", &self.replay_defaults)
            .finish_non_exhaustive()
    }
}

impl DeadLetterAdmin {
    /// Commands over `queue`, replaying through `replayer`.
    #[must_use]
    pub fn new(queue: Arc<DeadLetterQueue>, replayer: Arc<dyn DeadLetterReplayer>) -> Self {
        Self {
            queue,
            replayer,
            replay_defaults: ReplayOptions::default(),
        }
    }

    /// Concurrency and batch size used by `replay`.
    #[must_use]
    pub fn with_replay_defaults(mut self, options: ReplayOptions) -> Self {
        self.replay_defaults = options;
        self
    }

    /// `list [--limit N]`
    pub async fn list(&self, limit: Option<usize>) -> AdminOutcome {
        match self.queue.list(limit).await {
            Ok(entries) if entries.is_empty() => AdminOutcome::ok(vec!["dead-letter queue is empty".into()]),
            Ok(entries) => AdminOutcome::ok(entries.iter().map(summary_line).collect()),
            Err(e) => AdminOutcome::failed(&e),
        }
    }

    /// `show <id-prefix>`
    pub async fn show(&self, prefix: &str) -> AdminOutcome {
        match self.queue.find(prefix).await {
            Ok(entry) => AdminOutcome::ok(detail_lines(&entry)),
            Err(e) => AdminOutcome::failed(&e),
        }
    }

    /// `retry <id-prefix> [--force]`
    pub async fn retry(&self, prefix: &str, force: bool) -> AdminOutcome {
        match self.queue.retry(self.replayer.as_ref(), prefix, force).await {
            Ok(EntryOutcome::Replayed) => AdminOutcome::ok(vec![format!("replayed {prefix}")]),
            Ok(EntryOutcome::Skipped) => AdminOutcome::ok(vec![format!(
                "{prefix} exceeded its replay attempts; use --force to retry anyway"
            )]),
            Ok(EntryOutcome::Failed { attempt_count, error }) => AdminOutcome::refused(format!(
                "retry of {prefix} failed (attempt {attempt_count}): {error}"
            )),
            Err(e) => AdminOutcome::failed(&e),
        }
    }

    /// `replay [--force]`
    pub async fn replay(&self, force: bool) -> AdminOutcome {
        let options = ReplayOptions {
            force,
            ..self.replay_defaults.clone()
        };
        match self.queue.replay_events(self.replayer.as_ref(), options).await {
            Ok(report) if report.total == 0 && report.skipped == 0 => {
                AdminOutcome::ok(vec!["nothing to replay".into()])
            }
            Ok(report) => {
                let mut lines = vec![format!(
                    "replayed {} of {}: {} succeeded, {} failed, {} skipped",
                    report.succeeded + report.failed,
                    report.total,
                    report.succeeded,
                    report.failed,
                    report.skipped
                )];
                if report.cancelled {
                    lines.push("replay stopped before finishing".into());
                }
                AdminOutcome::ok(lines)
            }
            Err(e) => AdminOutcome::failed(&e),
        }
    }

    /// `clear [--force]`
    pub async fn clear(&self, force: bool) -> AdminOutcome {
        let count = match self.queue.len().await {
            Ok(count) => count,
            Err(e) => return AdminOutcome::failed(&e),
        };
        if count == 0 {
            return AdminOutcome::ok(vec!["dead-letter queue is already empty".into()]);
        }
        if !force {
            return AdminOutcome::refused(format!(
                "refusing to clear {count} dead letters without --force"
            ));
        }
        match self.queue.clear().await {
            Ok(cleared) => AdminOutcome::ok(vec![format!("cleared {cleared} dead letters")]),
            Err(e) => AdminOutcome::failed(&e),
        }
    }
}

fn summary_line(entry: &DeadLetterEvent) -> String {
    format!(
        "{}  {}  {}  attempts={}  {}",
        entry.short_id(),
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.event_type,
        entry.attempt_count,
        entry.reason
    )
}

fn detail_lines(entry: &DeadLetterEvent) -> Vec<String> {
    let subscription = entry
        .subscription_id
        .map_or_else(|| "-".to_owned(), |id| id.to_string());
    vec![
        format!("id:              {}", entry.id),
        format!("event type:      {}", entry.event_type),
        format!("reason:          {}", entry.reason),
        format!("error type:      {}", entry.error_type),
        format!("error:           {}", entry.error_message),
        format!("subscription:    {subscription}"),
        format!("attempts:        {}", entry.attempt_count),
        format!("created at:      {}", entry.created_at.to_rfc3339()),
        format!("last attempt at: {}", entry.last_attempt_at.to_rfc3339()),
        format!("payload:         {}", entry.payload),
    ]
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use eventide_core::clock::SharedClock;
    use eventide_core::event::RecordedEvent;
    use eventide_test_support::FixedClock;
    use uuid::Uuid;

    use super::*;
    use crate::dead_letter::{DeadLetterFailure, DeadLetterReason, InMemoryDeadLetterStore};
    use crate::error::{DeliveryError, HandlerError};
    use crate::middleware::test_support::event;

    struct Replayer {
        succeed: bool,
    }

    #[async_trait]
    impl DeadLetterReplayer for Replayer {
        async fn replay(&self, _: Option<Uuid>, _: &RecordedEvent) -> Result<(), DeliveryError> {
            if self.succeed {
                Ok(())
            } else {
                Err(HandlerError::Failed("still down".into()).into())
            }
        }
    }

    fn admin(succeed: bool) -> (DeadLetterAdmin, Arc<DeadLetterQueue>) {
        let clock: SharedClock = Arc::new(FixedClock::default_instant());
        let queue = Arc::new(DeadLetterQueue::new(Arc::new(InMemoryDeadLetterStore::new()), clock));
        let admin = DeadLetterAdmin::new(Arc::clone(&queue), Arc::new(Replayer { succeed }));
        (admin, queue)
    }

    async fn seed(queue: &DeadLetterQueue) -> DeadLetterEvent {
        let e = event("counter.incremented");
        queue
            .add(
                &e,
                &e.event_type,
                DeadLetterFailure {
                    reason: DeadLetterReason::HandlerError,
                    error_type: "HandlerError".into(),
                    error_message: "handler failed: boom".into(),
                    subscription_id: None,
                    attempt_count: 3,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_queue_commands_are_successful_no_ops() {
        // Arrange
        let (admin, _queue) = admin(true);

        // Act
        let list = admin.list(None).await;
        let replay = admin.replay(false).await;
        let clear = admin.clear(false).await;

        // Assert
        assert_eq!(list.exit_code, EXIT_OK);
        assert_eq!(replay.lines, vec!["nothing to replay".to_owned()]);
        assert!(replay.is_success());
        assert!(clear.is_success());
    }

    #[tokio::test]
    async fn test_list_and_show() {
        let (admin, queue) = admin(true);
        let entry = seed(&queue).await;

        let list = admin.list(Some(10)).await;
        let show = admin.show(&entry.short_id()).await;

        assert_eq!(list.lines.len(), 1);
        assert!(list.lines[0].starts_with(&entry.short_id()));
        assert!(show.is_success());
        assert!(show.lines.iter().any(|l| l.contains("handler failed: boom")));
    }

    #[tokio::test]
    async fn test_show_unknown_prefix_fails() {
        let (admin, _queue) = admin(true);

        let outcome = admin.show("deadbeef").await;

        assert_eq!(outcome.exit_code, EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_clear_requires_force() {
        // Arrange
        let (admin, queue) = admin(true);
        seed(&queue).await;

        // Act
        let refused = admin.clear(false).await;
        let forced = admin.clear(true).await;

        // Assert
        assert_eq!(refused.exit_code, EXIT_FAILURE);
        assert!(forced.is_success());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_reports_failure_with_non_zero_exit() {
        let (admin, queue) = admin(false);
        let entry = seed(&queue).await;

        let outcome = admin.retry(&entry.short_id(), false).await;

        assert_eq!(outcome.exit_code, EXIT_FAILURE);
        assert_eq!(queue.find(&entry.short_id()).await.unwrap().attempt_count, 4);
    }

    #[tokio::test]
    async fn test_replay_removes_entries() {
        let (admin, queue) = admin(true);
        seed(&queue).await;
        seed(&queue).await;

        let outcome = admin.replay(false).await;

        assert!(outcome.is_success());
        assert!(outcome.lines[0].contains("2 succeeded"));
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
