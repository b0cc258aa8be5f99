//! Domain event abstractions.
//!
//! Events exist in two shapes. A [`NewEvent`] has been produced by an
//! aggregate but not yet appended; it carries no sequence number. A
//! [`RecordedEvent`] is what a store hands back: the same fact stamped with
//! its stream and its position in that stream.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key holding the correlation ID.
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Metadata key holding the causation ID.
pub const CAUSATION_ID_KEY: &str = "causation_id";

/// Free-form key/value metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(BTreeMap<String, String>);

impl EventMetadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns a copy carrying the given correlation ID.
    #[must_use]
    pub fn with_correlation_id(self, correlation_id: Uuid) -> Self {
        self.with(CORRELATION_ID_KEY, correlation_id.to_string())
    }

    /// Returns a copy carrying the given causation ID.
    #[must_use]
    pub fn with_causation_id(self, causation_id: Uuid) -> Self {
        self.with(CAUSATION_ID_KEY, causation_id.to_string())
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parses the correlation ID, if present and well formed.
    #[must_use]
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.get(CORRELATION_ID_KEY)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Parses the causation ID, if present and well formed.
    #[must_use]
    pub fn causation_id(&self) -> Option<Uuid> {
        self.get(CAUSATION_ID_KEY).and_then(|v| Uuid::parse_str(v).ok())
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns `true` when no entries are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for EventMetadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An event that has been produced but not yet appended to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type of the aggregate that produced the event.
    pub aggregate_type: String,
    /// Event discriminator.
    pub event_type: String,
    /// Payload schema version, starting at 1.
    pub schema_version: u32,
    /// Timestamp of event creation.
    pub occurred_on: DateTime<Utc>,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// Key/value metadata.
    pub metadata: EventMetadata,
}

impl NewEvent {
    /// Creates a schema-version-1 event with a fresh identifier and no
    /// metadata.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        occurred_on: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            schema_version: 1,
            occurred_on,
            payload,
            metadata: EventMetadata::new(),
        }
    }

    /// Returns a copy with the given schema version.
    #[must_use]
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version.max(1);
        self
    }

    /// Returns a copy with the given metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns a copy with the given event identifier.
    #[must_use]
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Stamps the event with its stream and position. Only stores call this.
    #[must_use]
    pub fn record(self, stream_id: &str, sequence_number: u64) -> RecordedEvent {
        RecordedEvent {
            event_id: self.event_id,
            aggregate_id: stream_id.to_owned(),
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            schema_version: self.schema_version,
            sequence_number,
            occurred_on: self.occurred_on,
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// An event as persisted in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: String,
    /// Type of the aggregate that produced the event.
    pub aggregate_type: String,
    /// Event discriminator.
    pub event_type: String,
    /// Payload schema version.
    pub schema_version: u32,
    /// Position in the stream, starting at 1.
    pub sequence_number: u64,
    /// Timestamp of event creation.
    pub occurred_on: DateTime<Utc>,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// Key/value metadata.
    pub metadata: EventMetadata,
}

impl RecordedEvent {
    /// Returns a copy carrying a migrated payload.
    #[must_use]
    pub fn with_payload(&self, schema_version: u32, payload: serde_json::Value) -> Self {
        Self {
            schema_version,
            payload,
            ..self.clone()
        }
    }
}

/// A closed set of event variants produced and consumed by one aggregate.
///
/// Implementors are normally enums; every discriminator they can decode is
/// listed in [`DomainEvent::EVENT_TYPES`]. A recorded event whose type is not
/// listed has no state transition and aborts reconstruction.
pub trait DomainEvent: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Every event discriminator this type can decode.
    const EVENT_TYPES: &'static [&'static str];

    /// Returns the discriminator of this variant.
    fn event_type(&self) -> &'static str;

    /// Current producer schema version of `event_type`.
    fn current_schema_version(_event_type: &str) -> u32 {
        1
    }

    /// Schema version this variant is written with.
    fn schema_version(&self) -> u32 {
        Self::current_schema_version(self.event_type())
    }

    /// Serializes the variant body.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if the payload is not representable as JSON.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Decodes a variant from its discriminator and body.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the payload does not match the type.
    fn from_payload(event_type: &str, payload: serde_json::Value) -> Result<Self, serde_json::Error>;

    /// Returns `true` if `event_type` belongs to this set.
    fn handles(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }
}

/// Encodes an adjacently tagged enum (`#[serde(tag = "type", content =
/// "data")]`) into just its body.
///
/// # Errors
///
/// Returns the encoder error if the value cannot be serialized.
pub fn encode_tagged<T: Serialize>(value: &T) -> Result<serde_json::Value, serde_json::Error> {
    let mut tagged = serde_json::to_value(value)?;
    Ok(tagged
        .get_mut("data")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null))
}

/// Decodes an adjacently tagged enum from a discriminator and body.
///
/// # Errors
///
/// Returns the decoder error for unknown discriminators or malformed bodies.
pub fn decode_tagged<T: DeserializeOwned>(
    event_type: &str,
    payload: serde_json::Value,
) -> Result<T, serde_json::Error> {
    // Unit variants carry no body.
    if payload.is_null() {
        return serde_json::from_value(serde_json::json!({ "type": event_type }));
    }
    serde_json::from_value(serde_json::json!({ "type": event_type, "data": payload }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum Sample {
        #[serde(rename = "sample.created")]
        Created { name: String },
        #[serde(rename = "sample.archived")]
        Archived,
    }

    #[test]
    fn test_encode_tagged_strips_discriminator() {
        let body = encode_tagged(&Sample::Created { name: "a".into() }).unwrap();
        assert_eq!(body, serde_json::json!({ "name": "a" }));
    }

    #[test]
    fn test_decode_tagged_round_trips_unit_variant() {
        let body = encode_tagged(&Sample::Archived).unwrap();
        let decoded: Sample = decode_tagged("sample.archived", body).unwrap();
        assert_eq!(decoded, Sample::Archived);
    }

    #[test]
    fn test_decode_tagged_rejects_unknown_discriminator() {
        let result: Result<Sample, _> = decode_tagged("sample.deleted", serde_json::json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn test_record_assigns_stream_and_sequence() {
        // Arrange
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let event = NewEvent::new("Sample", "sample.archived", serde_json::json!({}), at)
            .with_schema_version(2)
            .with_metadata(EventMetadata::new().with("tenant", "t1"));

        // Act
        let recorded = event.clone().record("S-1", 7);

        // Assert
        assert_eq!(recorded.event_id, event.event_id);
        assert_eq!(recorded.aggregate_id, "S-1");
        assert_eq!(recorded.sequence_number, 7);
        assert_eq!(recorded.schema_version, 2);
        assert_eq!(recorded.occurred_on, at);
        assert_eq!(recorded.metadata.get("tenant"), Some("t1"));
    }

    #[test]
    fn test_schema_version_never_below_one() {
        let event = NewEvent::new("A", "a.b", serde_json::Value::Null, Utc::now())
            .with_schema_version(0);
        assert_eq!(event.schema_version, 1);
    }

    #[test]
    fn test_metadata_parses_correlation_and_causation() {
        let correlation = Uuid::new_v4();
        let causation = Uuid::new_v4();
        let metadata = EventMetadata::new()
            .with_correlation_id(correlation)
            .with_causation_id(causation);

        assert_eq!(metadata.correlation_id(), Some(correlation));
        assert_eq!(metadata.causation_id(), Some(causation));
        assert_eq!(EventMetadata::new().correlation_id(), None);
    }

    #[test]
    fn test_recorded_event_serializes_occurred_on_as_iso8601() {
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let recorded = NewEvent::new("A", "a.b", serde_json::json!({"k": 1}), at).record("A1", 1);

        let json = serde_json::to_value(&recorded).unwrap();

        assert_eq!(json["occurred_on"], "2026-01-15T10:00:00Z");
        assert_eq!(json["sequence_number"], 1);
        assert_eq!(json["payload"]["k"], 1);
    }
}
