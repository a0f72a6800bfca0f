// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Push channel wire format and typed realtime events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::epoch_ms;
use crate::error::ChannelError;

/// Reserved envelope type, consumed by the channel and never dispatched.
pub const HEARTBEAT: &str = "heartbeat";

// -- Wire format -------------------------------------------------------------

/// Wire message on the push channel: `{ "type", "data", "action"?, "timestamp" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<EventAction>,
    /// Epoch millis.
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data, action: None, timestamp: epoch_ms() }
    }

    pub fn with_action(mut self, action: EventAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT, Value::Null)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == HEARTBEAT
    }
}

/// What happened to the entity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

// -- Event kinds -------------------------------------------------------------

/// Closed set of event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Device,
    Message,
    Alert,
    System,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::Device, Self::Message, Self::Alert, Self::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Message => "message",
            Self::Alert => "alert",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Payloads ----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Warning,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    // Explicit discriminants keep the derived ordering (Unknown < Low)
    // while `#[serde(other)]` sits on the last variant as serde requires.
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
    /// A level this client does not know; orders below `Low`.
    #[serde(other)]
    Unknown = 0,
}

/// A device changed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A new protocol message arrived from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub message_id: String,
    pub device_id: String,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// An alert was raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertUpdate {
    pub alert_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    pub alert_level: AlertLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A system metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUpdate {
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Device(DeviceUpdate),
    Message(MessageUpdate),
    Alert(AlertUpdate),
    System(SystemUpdate),
}

/// A decoded, typed event ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub payload: EventPayload,
    /// Create, update or delete, when the backend said.
    pub action: Option<EventAction>,
    /// Envelope timestamp (epoch millis).
    pub timestamp: u64,
}

impl RealtimeEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self { payload, action: None, timestamp: epoch_ms() }
    }

    pub fn with_action(mut self, action: EventAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Device(_) => EventKind::Device,
            EventPayload::Message(_) => EventKind::Message,
            EventPayload::Alert(_) => EventKind::Alert,
            EventPayload::System(_) => EventKind::System,
        }
    }

    /// Re-encode as a wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        let data = match self.payload {
            EventPayload::Device(ref p) => serde_json::to_value(p),
            EventPayload::Message(ref p) => serde_json::to_value(p),
            EventPayload::Alert(ref p) => serde_json::to_value(p),
            EventPayload::System(ref p) => serde_json::to_value(p),
        };
        Envelope {
            kind: self.kind().as_str().to_owned(),
            data: data.unwrap_or(Value::Null),
            action: self.action,
            timestamp: self.timestamp,
        }
    }
}

/// Payload types that belong to exactly one event kind.
pub trait KindPayload: Sized {
    const KIND: EventKind;
    fn extract(payload: &EventPayload) -> Option<&Self>;
}

macro_rules! kind_payload {
    ($ty:ty, $variant:ident) => {
        impl KindPayload for $ty {
            const KIND: EventKind = EventKind::$variant;
            fn extract(payload: &EventPayload) -> Option<&Self> {
                match payload {
                    EventPayload::$variant(p) => Some(p),
                    _ => None,
                }
            }
        }
    };
}

kind_payload!(DeviceUpdate, Device);
kind_payload!(MessageUpdate, Message);
kind_payload!(AlertUpdate, Alert);
kind_payload!(SystemUpdate, System);

// -- Frame decoding ----------------------------------------------------------

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    Event(RealtimeEvent),
    /// Well-formed envelope of a kind nobody can subscribe to.
    Unknown(String),
}

/// Decode a text frame. Errors are malformed frames: logged, never dispatched.
pub fn decode_frame(text: &str) -> Result<Inbound, ChannelError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ChannelError::MalformedFrame(e.to_string()))?;
    if envelope.is_heartbeat() {
        return Ok(Inbound::Heartbeat);
    }
    let Some(kind) = EventKind::parse(&envelope.kind) else {
        return Ok(Inbound::Unknown(envelope.kind));
    };

    let bad_payload = |e: serde_json::Error| ChannelError::MalformedFrame(format!("{kind} payload: {e}"));
    let payload = match kind {
        EventKind::Device => {
            EventPayload::Device(serde_json::from_value(envelope.data).map_err(bad_payload)?)
        }
        EventKind::Message => {
            EventPayload::Message(serde_json::from_value(envelope.data).map_err(bad_payload)?)
        }
        EventKind::Alert => {
            EventPayload::Alert(serde_json::from_value(envelope.data).map_err(bad_payload)?)
        }
        EventKind::System => {
            EventPayload::System(serde_json::from_value(envelope.data).map_err(bad_payload)?)
        }
    };
    Ok(Inbound::Event(RealtimeEvent {
        payload,
        action: envelope.action,
        timestamp: envelope.timestamp,
    }))
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
