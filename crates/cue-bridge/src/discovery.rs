//! Home Assistant discovery and state payloads
//!
//! Builds the retained discovery documents for devices, the aggregate light
//! and the control switch, plus the JSON state payloads published on every
//! state topic and the command payloads received on `set` topics.
//!
//! Reference: https://www.home-assistant.io/integrations/light.mqtt/#json-schema

use serde::{Deserialize, Serialize};

use crate::device::Rgb;
use crate::registry::{AggregateState, EntityTopics, RegistryEntry, AGGREGATE_ID, CONTROL_SWITCH_ID};

/// Display name of the aggregate light
pub const AGGREGATE_NAME: &str = "All iCUE Devices";

/// Display name of the control switch
pub const CONTROL_SWITCH_NAME: &str = "iCue Control";

/// Logical on/off flag of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl PowerState {
    /// A colour is ON iff any channel is lit
    pub fn from_color(color: Rgb) -> Self {
        if color.is_on() { Self::On } else { Self::Off }
    }

    pub fn from_bool(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }

    /// Plain-text form used by the control switch
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Parse the plain-text switch payload
    pub fn parse_plain(payload: &[u8]) -> Option<Self> {
        match std::str::from_utf8(payload).ok()?.trim() {
            "ON" => Some(Self::On),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }
}

/// `{"state": "ON", "color": {"r": 1, "g": 2, "b": 3}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub state: PowerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
}

impl StatePayload {
    /// State of a single device.
    ///
    /// Dark devices still report `{0,0,0}` alongside the OFF flag.
    pub fn device(color: Rgb) -> Self {
        Self {
            state: PowerState::from_color(color),
            color: Some(color),
        }
    }

    /// State of the aggregate light; an empty registry has no colour at all
    pub fn aggregate(aggregate: AggregateState) -> Self {
        Self {
            state: aggregate.state,
            color: aggregate.color,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Inbound command on a light `set` topic.
///
/// Unknown fields (brightness, transition, ...) are ignored.
pub type CommandPayload = StatePayload;

/// Parse a command payload; `None` for anything malformed
pub fn parse_command(payload: &[u8]) -> Option<CommandPayload> {
    match serde_json::from_slice(payload) {
        Ok(command) => Some(command),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed command payload");
            None
        }
    }
}

/// Retained discovery document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub unique_id: String,
    pub platform: String,
    pub state_topic: String,
    pub command_topic: String,
    pub schema: String,
    pub supported_color_modes: Vec<String>,
    pub optimistic: bool,
    pub qos: u8,
}

impl DiscoveryDocument {
    fn new(
        name: impl Into<String>,
        unique_id: impl Into<String>,
        topics: &EntityTopics,
        color_modes: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            unique_id: unique_id.into(),
            platform: "mqtt_json".to_string(),
            state_topic: topics.state.clone(),
            command_topic: topics.command.clone(),
            schema: "json".to_string(),
            supported_color_modes: color_modes,
            optimistic: false,
            qos: 0,
        }
    }

    /// RGB light
    pub fn light(name: impl Into<String>, unique_id: impl Into<String>, topics: &EntityTopics) -> Self {
        Self::new(name, unique_id, topics, vec!["rgb".to_string()])
    }

    /// On/off switch without colour capability
    pub fn switch(name: impl Into<String>, unique_id: impl Into<String>, topics: &EntityTopics) -> Self {
        Self::new(name, unique_id, topics, Vec::new())
    }

    /// Discovery document for a registered device
    pub fn for_entry(entry: &RegistryEntry) -> Self {
        Self::light(&entry.display_name, &entry.entity_id, &entry.topics)
    }

    /// Discovery document for the aggregate light
    pub fn aggregate(topics: &EntityTopics) -> Self {
        Self::light(AGGREGATE_NAME, AGGREGATE_ID, topics)
    }

    /// Discovery document for the control switch
    pub fn control_switch(topics: &EntityTopics) -> Self {
        Self::switch(CONTROL_SWITCH_NAME, CONTROL_SWITCH_ID, topics)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
