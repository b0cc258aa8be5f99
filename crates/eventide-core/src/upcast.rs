//! Upcasting pipeline.
//!
//! An upcaster lifts one event type's payload from schema version `N` to
//! `N + 1`. The chain composes single steps so that an event recorded under
//! any older schema reaches the current one on read. Stored events are
//! never rewritten.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::UpcastError;
use crate::event::RecordedEvent;

/// A single schema migration step for one event type.
pub trait Upcaster: Send + Sync {
    /// Event discriminator this step applies to.
    fn event_type(&self) -> &str;

    /// Schema version this step reads. It produces `from_version() + 1`.
    fn from_version(&self) -> u32;

    /// Transforms the payload.
    ///
    /// # Errors
    ///
    /// Returns `UpcastError::Failed` if the payload cannot be migrated.
    fn upcast(&self, payload: serde_json::Value) -> Result<serde_json::Value, UpcastError>;
}

/// Closure-backed upcaster.
pub struct FnUpcaster<F> {
    event_type: String,
    from_version: u32,
    transform: F,
}

impl<F> FnUpcaster<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync,
{
    /// Creates a step from `event_type` v`from_version` to the next version.
    pub fn new(event_type: impl Into<String>, from_version: u32, transform: F) -> Self {
        Self {
            event_type: event_type.into(),
            from_version,
            transform,
        }
    }
}

impl<F> Upcaster for FnUpcaster<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync,
{
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn from_version(&self) -> u32 {
        self.from_version
    }

    fn upcast(&self, payload: serde_json::Value) -> Result<serde_json::Value, UpcastError> {
        (self.transform)(payload).map_err(|reason| UpcastError::Failed {
            event_type: self.event_type.clone(),
            from_version: self.from_version,
            reason,
        })
    }
}

/// Registry of upcasters keyed by `(event_type, from_version)`.
#[derive(Clone, Default)]
pub struct UpcasterChain {
    steps: HashMap<(String, u32), Arc<dyn Upcaster>>,
}

impl std::fmt::Debug for UpcasterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.steps.keys().collect();
        keys.sort();
        f.debug_struct("UpcasterChain").field("steps", &keys).finish()
    }
}

impl UpcasterChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step, replacing any step with the same key.
    pub fn register(&mut self, upcaster: impl Upcaster + 'static) -> &mut Self {
        let key = (upcaster.event_type().to_owned(), upcaster.from_version());
        self.steps.insert(key, Arc::new(upcaster));
        self
    }

    /// Builder-style [`UpcasterChain::register`].
    #[must_use]
    pub fn with(mut self, upcaster: impl Upcaster + 'static) -> Self {
        self.register(upcaster);
        self
    }

    /// Returns `true` if no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Highest schema version reachable for `event_type` by following
    /// consecutive steps from version 1.
    #[must_use]
    pub fn latest_version(&self, event_type: &str) -> u32 {
        let mut version = 1;
        while self.steps.contains_key(&(event_type.to_owned(), version)) {
            version += 1;
        }
        version
    }

    /// Lifts `event` to `target`. Events already at or beyond `target` are
    /// returned unchanged, so applying the same target twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `UpcastError::MissingStep` if an intermediate step is not
    /// registered, or the step's own error.
    pub fn upcast(&self, event: RecordedEvent, target: u32) -> Result<RecordedEvent, UpcastError> {
        if event.schema_version >= target {
            return Ok(event);
        }
        let mut version = event.schema_version.max(1);
        let mut payload = event.payload.clone();
        while version < target {
            let step = self
                .steps
                .get(&(event.event_type.clone(), version))
                .ok_or_else(|| UpcastError::MissingStep {
                    event_type: event.event_type.clone(),
                    from_version: version,
                })?;
            payload = step.upcast(payload)?;
            version += 1;
        }
        tracing::trace!(
            event_type = %event.event_type,
            from = event.schema_version,
            to = version,
            "upcast event payload"
        );
        Ok(event.with_payload(version, payload))
    }

    /// Lifts `event` to the latest version this chain knows for its type.
    ///
    /// # Errors
    ///
    /// See [`UpcasterChain::upcast`].
    pub fn upcast_to_latest(&self, event: RecordedEvent) -> Result<RecordedEvent, UpcastError> {
        let target = self.latest_version(&event.event_type);
        self.upcast(event, target)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::event::NewEvent;

    fn recorded(schema_version: u32, payload: serde_json::Value) -> RecordedEvent {
        NewEvent::new("Account", "account.opened", payload, Utc::now())
            .with_schema_version(schema_version)
            .record("acc-1", 1)
    }

    fn chain() -> UpcasterChain {
        UpcasterChain::new()
            .with(FnUpcaster::new("account.opened", 1, |mut p| {
                let owner = p
                    .get("name")
                    .cloned()
                    .ok_or_else(|| "missing name".to_owned())?;
                p["owner"] = owner;
                if let Some(obj) = p.as_object_mut() {
                    obj.remove("name");
                }
                Ok(p)
            }))
            .with(FnUpcaster::new("account.opened", 2, |mut p| {
                p["currency"] = json!("EUR");
                Ok(p)
            }))
    }

    #[test]
    fn test_upcast_applies_consecutive_steps() {
        // Arrange
        let event = recorded(1, json!({ "name": "ada" }));

        // Act
        let upcast = chain().upcast(event, 3).unwrap();

        // Assert
        assert_eq!(upcast.schema_version, 3);
        assert_eq!(upcast.payload, json!({ "owner": "ada", "currency": "EUR" }));
    }

    #[test]
    fn test_upcast_is_idempotent_for_same_target() {
        let chain = chain();
        let once = chain.upcast(recorded(1, json!({ "name": "ada" })), 3).unwrap();
        let twice = chain.upcast(once.clone(), 3).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upcast_never_downcasts() {
        let event = recorded(3, json!({ "owner": "ada", "currency": "EUR" }));
        let result = chain().upcast(event.clone(), 2).unwrap();
        assert_eq!(result, event);
    }

    #[test]
    fn test_upcast_reports_missing_step() {
        let result = chain().upcast(recorded(1, json!({ "name": "ada" })), 4);
        assert!(matches!(
            result,
            Err(UpcastError::MissingStep { from_version: 3, .. })
        ));
    }

    #[test]
    fn test_upcast_surfaces_step_failure() {
        let result = chain().upcast(recorded(1, json!({})), 2);
        match result {
            Err(UpcastError::Failed { reason, .. }) => assert_eq!(reason, "missing name"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_latest_version_follows_registered_steps() {
        let chain = chain();
        assert_eq!(chain.latest_version("account.opened"), 3);
        assert_eq!(chain.latest_version("account.closed"), 1);
        let latest = chain
            .upcast_to_latest(recorded(2, json!({ "owner": "ada" })))
            .unwrap();
        assert_eq!(latest.schema_version, 3);
    }
}
