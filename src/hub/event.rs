//! Outbound event shapes.
//!
//! Every event goes out as one JSON envelope:
//! `{"type": "<kind>", "timestamp_ms": <u64>, "data": {...}}`

use serde::{Deserialize, Serialize};

use crate::door::{DoorStatus, LockTrigger};
use crate::log::RecognitionEntry;
use crate::settings::ConfigSnapshot;
use crate::{now_epoch_ms, Detection};

/// Annotated frame for live viewers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameEvent {
    /// Base64 JPEG.
    pub image: String,
    pub detections: Vec<Detection>,
    pub door_status: DoorStatus,
    pub frame_index: u64,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoorUnlockedEvent {
    /// Identity name, or "manual" for a manual unlock.
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub duration_secs: u64,
    pub auto_unlock: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoorLockedEvent {
    pub manual: bool,
    pub trigger: LockTrigger,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundEvent {
    Frame(FrameEvent),
    Recognition(RecognitionEntry),
    DoorUnlocked(DoorUnlockedEvent),
    DoorLocked(DoorLockedEvent),
    DoorStatus(DoorStatus),
    ConfigUpdated(ConfigSnapshot),
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp_ms: u64,
    data: &'a OutboundEvent,
}

impl OutboundEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Frame(_) => "frame",
            OutboundEvent::Recognition(_) => "recognition",
            OutboundEvent::DoorUnlocked(_) => "door_unlocked",
            OutboundEvent::DoorLocked(_) => "door_locked",
            OutboundEvent::DoorStatus(_) => "door_status",
            OutboundEvent::ConfigUpdated(_) => "config_updated",
        }
    }

    /// Serialize into the JSON envelope.
    pub fn to_envelope_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            kind: self.kind(),
            timestamp_ms: now_epoch_ms(),
            data: self,
        })
    }
}
