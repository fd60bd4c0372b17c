//! Request/response shapes of the line-delimited JSON transport.
//!
//! Inbound lines are requests tagged by `type`. Responses are tagged by
//! `response`, so a client can tell them apart from event envelopes (which
//! carry `type`) on the same connection.

use serde::{Deserialize, Serialize};

use crate::detect::UserSummary;
use crate::door::DoorStatus;
use crate::log::RecognitionEntry;
use crate::settings::{ConfigSnapshot, PerformanceProfile, PolicyUpdate, ProfileUpdate};

/// Default number of entries returned by `get_recognition_log`.
pub const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    UnlockDoor {
        /// Seconds; the configured lock duration when absent.
        #[serde(default)]
        duration: Option<u64>,
    },
    LockDoor,
    GetDoorStatus,
    UpdatePerformanceSettings {
        settings: ProfileUpdate,
    },
    UpdateDoorConfig {
        config: PolicyUpdate,
    },
    GetUsers,
    GetRecognitionLog {
        #[serde(default)]
        limit: Option<usize>,
    },
    CaptureSnapshot,
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    DoorStatus(DoorStatus),
    PerformanceSettings(PerformanceProfile),
    Config(ConfigSnapshot),
    Users {
        users: Vec<UserSummary>,
    },
    RecognitionLog {
        entries: Vec<RecognitionEntry>,
    },
    Snapshot {
        /// Base64 JPEG.
        image: String,
        width: u32,
        height: u32,
        quality: u8,
    },
    Pong {
        timestamp_ms: u64,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_requests() -> anyhow::Result<()> {
        let unlock: Request = serde_json::from_str(r#"{"type":"unlock_door","duration":7}"#)?;
        assert_eq!(unlock, Request::UnlockDoor { duration: Some(7) });

        let unlock_default: Request = serde_json::from_str(r#"{"type":"unlock_door"}"#)?;
        assert_eq!(unlock_default, Request::UnlockDoor { duration: None });

        let update: Request = serde_json::from_str(
            r#"{"type":"update_performance_settings","settings":{"target_fps":5.0}}"#,
        )?;
        match update {
            Request::UpdatePerformanceSettings { settings } => {
                assert_eq!(settings.target_fps, Some(5.0));
                assert_eq!(settings.jpeg_quality, None);
            }
            other => panic!("unexpected request {:?}", other),
        }

        assert!(serde_json::from_str::<Request>(r#"{"type":"open_sesame"}"#).is_err());
        Ok(())
    }

    #[test]
    fn responses_are_tagged_by_response() -> anyhow::Result<()> {
        let value = serde_json::to_value(Response::Pong { timestamp_ms: 42 })?;
        assert_eq!(value["response"], "pong");
        assert!(value.get("type").is_none());

        let error = serde_json::to_value(Response::error("nope"))?;
        assert_eq!(error["response"], "error");
        assert_eq!(error["message"], "nope");
        Ok(())
    }
}
