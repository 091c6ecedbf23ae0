use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A CloudEvents 1.0 envelope, as sent to Queue Storage and Event Grid.
///
/// Serializes to the standard CloudEvents JSON representation
/// (`specversion`, `id`, `source`, `type`, `time`, `datacontenttype`,
/// `data`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    /// CloudEvents specification version, always `"1.0"`.
    pub specversion: String,

    /// Event identifier, defaults to a fresh UUID v4.
    pub id: String,

    /// Event source (producer identity).
    pub source: String,

    /// Event type, e.g. `"invoice.created"`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event timestamp. Defaulted to the current UTC time at send when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Content type of `data`, defaults to `"application/json"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    /// Event payload.
    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            specversion: "1.0".to_owned(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Some(Utc::now()),
            datacontenttype: Some("application/json".to_owned()),
            data,
        }
    }

    /// Fill in the timestamp when the caller left it unset.
    pub(crate) fn ensure_time(&mut self) {
        if self.time.is_none() {
            self.time = Some(Utc::now());
        }
    }
}

/// A domain event that can be published to Event Grid.
///
/// Implementors provide the CloudEvent `type` attribute; the serialized
/// value becomes the event `data`.
pub trait Event: Serialize {
    /// The CloudEvent `type` attribute for this event.
    fn event_type(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_fills_defaults() {
        let event = CloudEvent::new("/billing", "invoice.created", serde_json::json!({"id": 7}));
        assert_eq!(event.specversion, "1.0");
        assert_eq!(event.source, "/billing");
        assert_eq!(event.event_type, "invoice.created");
        assert!(event.time.is_some());
        assert_eq!(event.datacontenttype.as_deref(), Some("application/json"));
        assert!(!event.id.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let a = CloudEvent::new("s", "t", serde_json::Value::Null);
        let b = CloudEvent::new("s", "t", serde_json::Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn serializes_with_cloudevents_field_names() {
        let mut event = CloudEvent::new("/billing", "invoice.paid", serde_json::json!({"no": 42}));
        event.id = "abc-123".to_owned();
        event.time = None;

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["id"], "abc-123");
        assert_eq!(json["source"], "/billing");
        assert_eq!(json["type"], "invoice.paid");
        assert_eq!(json["data"]["no"], 42);
        // Unset time is omitted entirely, not serialized as null.
        assert!(json.get("time").is_none());
    }

    #[test]
    fn ensure_time_only_sets_when_missing() {
        let mut event = CloudEvent::new("s", "t", serde_json::Value::Null);
        let original = event.time;
        event.ensure_time();
        assert_eq!(event.time, original);

        event.time = None;
        event.ensure_time();
        assert!(event.time.is_some());
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let event: CloudEvent = serde_json::from_str(
            r#"{"specversion":"1.0","id":"1","source":"s","type":"t","data":{}}"#,
        )
        .unwrap();
        assert!(event.time.is_none());
        assert!(event.datacontenttype.is_none());
    }
}
