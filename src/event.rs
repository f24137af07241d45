//! Telemetry event records and the JSON wire envelope.
//!
//! An [`Event`] is stamped once, when its producer generates it. Nothing
//! downstream re-stamps it; consumers order by arrival.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire type of the control message carrying a user-facing alert.
pub const ALERT_TYPE: &str = "alert";

/// Wire type the relay uses to wrap events forwarded to dashboards.
pub const LIVE_EVENT_TYPE: &str = "live_event";

/// Wire type of the relay's per-session score broadcasts.
pub const SCORE_UPDATE_TYPE: &str = "score_update";

/// Category of an event.
///
/// Unknown categories survive a round trip as [`EventType::Other`] so the
/// feed can still show them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Gaze,
    Audio,
    Screen,
    System,
    Other(String),
}

impl EventType {
    /// The four categories producers emit.
    pub const KNOWN: [EventType; 4] = [
        EventType::Gaze,
        EventType::Audio,
        EventType::Screen,
        EventType::System,
    ];

    /// Name used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Gaze => "eye_tracking",
            EventType::Audio => "audio",
            EventType::Screen => "screen",
            EventType::System => "system",
            EventType::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "eye_tracking" | "gaze" => EventType::Gaze,
            "audio" => EventType::Audio,
            "screen" => EventType::Screen,
            "system" => EventType::System,
            _ => EventType::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    session_id: String,
    /// Milliseconds since the Unix epoch, assigned at generation time.
    timestamp: i64,
    data: Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        timestamp: i64,
        data: Value,
    ) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            timestamp,
            data,
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|m| m.get(key))
    }

    /// Rebuild an event from an inbound wire message.
    ///
    /// Accepts both direct category messages and the relay's `live_event`
    /// wrapper. Control messages and messages without a generation timestamp
    /// yield `None`.
    pub fn from_wire(message: WireMessage) -> Option<Event> {
        if message.kind == LIVE_EVENT_TYPE {
            let mut data = match message.data {
                Value::Object(map) => map,
                _ => return None,
            };
            let event_type = match data.remove("event_type") {
                Some(Value::String(kind)) => EventType::from(kind),
                _ => return None,
            };
            let session_id = match data.remove("session_id") {
                Some(Value::String(id)) => id,
                _ => return None,
            };
            let timestamp = data
                .remove("timestamp")
                .and_then(|v| v.as_i64())
                .or(message.timestamp)?;
            return Some(Event::new(
                event_type,
                session_id,
                timestamp,
                Value::Object(data),
            ));
        }

        if message.kind == ALERT_TYPE || message.kind == SCORE_UPDATE_TYPE {
            return None;
        }

        let session_id = message
            .session_id
            .or_else(|| {
                message
                    .data
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown-session".to_string());
        Some(Event::new(
            EventType::from(message.kind),
            session_id,
            message.timestamp?,
            message.data,
        ))
    }

    /// Wrap this event the way the relay forwards it to dashboards.
    pub fn to_live_event(&self) -> WireMessage {
        let mut data = match &self.data {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        data.insert(
            "event_type".to_string(),
            Value::String(self.event_type.as_str().to_string()),
        );
        data.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        data.insert("timestamp".to_string(), Value::from(self.timestamp));
        WireMessage {
            kind: LIVE_EVENT_TYPE.to_string(),
            data: Value::Object(data),
            timestamp: Some(self.timestamp),
            session_id: None,
        }
    }
}

/// JSON envelope carried by the transport: `{ type, data, timestamp? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Some(now_millis()),
            session_id: None,
        }
    }

    pub fn is_alert(&self) -> bool {
        self.kind == ALERT_TYPE
    }

    /// `data.message` of an alert, if present.
    pub fn alert_message(&self) -> Option<&str> {
        self.data.get("message").and_then(|v| v.as_str())
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-producer stamp source that never goes backwards, even if the wall
/// clock does.
#[derive(Debug, Default, Clone)]
pub struct EventClock {
    last: i64,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self) -> i64 {
        self.observe(now_millis())
    }

    /// Stamp using an externally supplied wall-clock reading.
    pub fn observe(&mut self, wall_ms: i64) -> i64 {
        self.last = self.last.max(wall_ms);
        self.last
    }
}
