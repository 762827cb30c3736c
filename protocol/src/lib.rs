//! Wire protocol shared by the relay and every display instance.
//!
//! This crate owns the JSON representation used by both `server` and `client`.
//! It has no transport concerns; callers hand it text and get typed messages
//! back (or the reverse).
//!
//! DESIGN
//! ======
//! Every message is an envelope `{"type": "<kind>", "data": {...}}` and the set
//! of kinds is closed:
//!
//! - client → relay: `get_state`, `clock_change`, `parameter_change`
//! - relay → client: `state_sync`, `clock_change`, `parameter_change`
//!
//! Decoding is two-step: the envelope first, then the typed payload for the
//! kind it names. That keeps "unknown kind" and "known kind with a bad
//! payload" apart, so callers can log them differently.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// MESSAGE KINDS
// =============================================================================

/// Client asks for a fresh snapshot.
pub const GET_STATE: &str = "get_state";

/// Full snapshot of the relay's state.
pub const STATE_SYNC: &str = "state_sync";

/// Active widget changed.
pub const CLOCK_CHANGE: &str = "clock_change";

/// One parameter of one widget changed.
pub const PARAMETER_CHANGE: &str = "parameter_change";

// =============================================================================
// TYPES
// =============================================================================

/// Index of a widget variant (clock face) in the display's widget list.
pub type WidgetIndex = u32;

/// Parameter name → value for one widget. Values are arbitrary JSON.
pub type ParameterMap = HashMap<String, Value>;

/// Error returned by the decode and encode functions.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Text is not JSON, or is JSON without a string `type` field.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Envelope names a kind this side of the protocol does not handle.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// Envelope kind is known but `data` is missing fields or ill-typed.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// Serialization failed.
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings key for a widget index, e.g. `widget_3`.
#[must_use]
pub fn widget_key(index: WidgetIndex) -> String {
    format!("widget_{index}")
}

/// The relay's canonical shared configuration.
///
/// Wire names are `clockIndex` and `clockSettings`. A widget with no entry in
/// `widget_settings` (or a parameter missing from its map) uses the widget's
/// own default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(rename = "clockIndex", default)]
    pub active_widget_index: WidgetIndex,
    #[serde(rename = "clockSettings", default)]
    pub widget_settings: HashMap<String, ParameterMap>,
}

impl GlobalState {
    /// Stored parameters for a widget, if any were ever written.
    #[must_use]
    pub fn widget(&self, index: WidgetIndex) -> Option<&ParameterMap> {
        self.widget_settings.get(&widget_key(index))
    }

    /// Stored value of one parameter.
    #[must_use]
    pub fn parameter(&self, index: WidgetIndex, parameter: &str) -> Option<&Value> {
        self.widget(index).and_then(|params| params.get(parameter))
    }
}

/// Payload of `clock_change`.
///
/// `clockIndex` is accepted on input as an alias of `widgetIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockChange {
    #[serde(alias = "clockIndex")]
    pub widget_index: WidgetIndex,
}

/// Payload of `parameter_change`. All three fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterChange {
    #[serde(alias = "clockIndex")]
    pub widget_index: WidgetIndex,
    pub parameter: String,
    pub value: Value,
}

impl ParameterChange {
    pub fn new(widget_index: WidgetIndex, parameter: impl Into<String>, value: Value) -> Self {
        Self { widget_index, parameter: parameter.into(), value }
    }
}

/// Messages a display instance sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    GetState,
    ClockChange(ClockChange),
    ParameterChange(ParameterChange),
}

/// Messages the relay sends to a display instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    StateSync(GlobalState),
    ClockChange(ClockChange),
    ParameterChange(ParameterChange),
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

/// `get_state` carries an empty object.
#[derive(Serialize)]
struct EmptyData {}

fn parse_envelope(text: &str) -> Result<InboundEnvelope, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

fn encode<T: Serialize>(kind: &'static str, data: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(&OutboundEnvelope { kind, data }).map_err(|source| ProtocolError::Encode { kind, source })
}

// =============================================================================
// CLIENT MESSAGES
// =============================================================================

impl ClientMessage {
    /// Wire `type` of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetState => GET_STATE,
            Self::ClockChange(_) => CLOCK_CHANGE,
            Self::ParameterChange(_) => PARAMETER_CHANGE,
        }
    }

    /// Serialize into the JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            Self::GetState => encode(GET_STATE, &EmptyData {}),
            Self::ClockChange(data) => encode(CLOCK_CHANGE, data),
            Self::ParameterChange(data) => encode(PARAMETER_CHANGE, data),
        }
    }

    /// Parse a JSON envelope sent by a display instance.
    ///
    /// `get_state` ignores its `data` (which may be omitted entirely).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for non-JSON or envelope-less text,
    /// [`ProtocolError::UnknownType`] for kinds a client may not send, and
    /// [`ProtocolError::InvalidPayload`] when required fields are missing.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = parse_envelope(text)?;
        match envelope.kind.as_str() {
            GET_STATE => Ok(Self::GetState),
            CLOCK_CHANGE => payload(CLOCK_CHANGE, envelope.data).map(Self::ClockChange),
            PARAMETER_CHANGE => payload(PARAMETER_CHANGE, envelope.data).map(Self::ParameterChange),
            _ => Err(ProtocolError::UnknownType(envelope.kind)),
        }
    }
}

// =============================================================================
// SERVER MESSAGES
// =============================================================================

impl ServerMessage {
    /// Wire `type` of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateSync(_) => STATE_SYNC,
            Self::ClockChange(_) => CLOCK_CHANGE,
            Self::ParameterChange(_) => PARAMETER_CHANGE,
        }
    }

    /// Serialize into the JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            Self::StateSync(data) => encode(STATE_SYNC, data),
            Self::ClockChange(data) => encode(CLOCK_CHANGE, data),
            Self::ParameterChange(data) => encode(PARAMETER_CHANGE, data),
        }
    }

    /// Parse a JSON envelope sent by the relay.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`ClientMessage::decode`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = parse_envelope(text)?;
        match envelope.kind.as_str() {
            STATE_SYNC => payload(STATE_SYNC, envelope.data).map(Self::StateSync),
            CLOCK_CHANGE => payload(CLOCK_CHANGE, envelope.data).map(Self::ClockChange),
            PARAMETER_CHANGE => payload(PARAMETER_CHANGE, envelope.data).map(Self::ParameterChange),
            _ => Err(ProtocolError::UnknownType(envelope.kind)),
        }
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
