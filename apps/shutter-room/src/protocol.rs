use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rooms::{JoinReason, Role, RoleLimits, Roster};

/// Messages sent from a device to the room server.
///
/// Unknown `type` values land in [`ClientMessage::Unknown`] and are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness check, allowed before joining
    Ping,
    /// Request a role slot; the name is validated by the server
    Join { role: String },
    /// Shutter command; relayed with the sender's fields
    TakePhoto,
    /// An artifact was stored; the server stamps device id and sequence
    PhotoUploaded {
        picture_id: Value,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        pictured_at: Option<String>,
    },
    RecorderAcquire {
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    RecorderHeartbeat {
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    RecorderRelease,
    #[serde(other)]
    Unknown,
}

/// Messages sent from the room server to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection diagnostics, always the first frame
    Hello {
        room: String,
        device_id: String,
        origin: Option<String>,
        host: Option<String>,
    },
    Pong,
    JoinOk {
        role: Role,
        limits: RoleLimits,
    },
    JoinDenied {
        reason: JoinReason,
        limits: RoleLimits,
    },
    RosterUpdate(Roster),
    PhotoUploaded {
        seq: u64,
        picture_id: Value,
        device_id: String,
        image_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pictured_at: Option<String>,
    },
    RecorderGranted {
        device_id: String,
        ttl_ms: u64,
        renewed: bool,
    },
    RecorderDenied {
        reason: LeaseDenial,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },
    RecorderRevoked {
        device_id: String,
        reason: RevokeReason,
    },
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseDenial {
    NotController,
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    Expired,
    Disconnected,
    Superseded,
    RoleChanged,
}

impl RevokeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevokeReason::Expired => "expired",
            RevokeReason::Disconnected => "disconnected",
            RevokeReason::Superseded => "superseded",
            RevokeReason::RoleChanged => "role_changed",
        }
    }
}

/// Parses one inbound frame. `None` means the frame is dropped: not JSON, not
/// an object, or a known type with malformed fields.
pub fn parse_client_frame(text: &str) -> Option<(ClientMessage, Value)> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }
    let message = ClientMessage::deserialize(&value).ok()?;
    Some((message, value))
}

/// Relay body for `take_photo`: the sender's object with `origin_device_id`
/// replaced by the connection's own device id.
pub fn take_photo_relay(mut raw: Value, device_id: &str) -> Value {
    if let Some(fields) = raw.as_object_mut() {
        fields.insert("type".into(), Value::from("take_photo"));
        fields.insert("origin_device_id".into(), Value::from(device_id));
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn unknown_types_are_recognised_not_rejected() {
        let (message, _) = parse_client_frame(r#"{"type":"dance","speed":3}"#).unwrap();
        assert_eq!(message, ClientMessage::Unknown);
    }

    #[test_timeout::timeout]
    fn garbage_frames_are_dropped() {
        assert!(parse_client_frame("not json").is_none());
        assert!(parse_client_frame("[1,2]").is_none());
        assert!(parse_client_frame(r#"{"role":"controller"}"#).is_none());
        assert!(parse_client_frame(r#"{"type":"join"}"#).is_none());
        assert!(parse_client_frame(r#"{"type":"photo_uploaded"}"#).is_none());
    }

    #[test_timeout::timeout]
    fn optional_fields_default() {
        let (message, _) = parse_client_frame(r#"{"type":"recorder_acquire"}"#).unwrap();
        assert_eq!(message, ClientMessage::RecorderAcquire { ttl_ms: None });

        let (message, _) =
            parse_client_frame(r#"{"type":"photo_uploaded","picture_id":7,"seq":99}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::PhotoUploaded {
                picture_id: json!(7),
                image_url: None,
                pictured_at: None
            }
        );
    }

    #[test_timeout::timeout]
    fn take_photo_relay_overwrites_origin_and_keeps_the_rest() {
        let (message, raw) = parse_client_frame(
            r#"{"type":"take_photo","origin_device_id":"spoofed","ts":1700000000,"mode":"burst"}"#,
        )
        .unwrap();
        assert_eq!(message, ClientMessage::TakePhoto);

        let relayed = take_photo_relay(raw, "cam-1");
        assert_eq!(
            relayed,
            json!({
                "type": "take_photo",
                "origin_device_id": "cam-1",
                "ts": 1700000000,
                "mode": "burst"
            })
        );
    }

    #[test_timeout::timeout]
    fn server_messages_use_snake_case_tags() {
        let revoked = ServerMessage::RecorderRevoked {
            device_id: "d1".into(),
            reason: RevokeReason::Expired,
        };
        assert_eq!(
            serde_json::to_value(&revoked).unwrap(),
            json!({"type": "recorder_revoked", "device_id": "d1", "reason": "expired"})
        );

        let denied = ServerMessage::RecorderDenied {
            reason: LeaseDenial::Held,
            holder: Some("d1".into()),
        };
        assert_eq!(
            serde_json::to_value(&denied).unwrap(),
            json!({"type": "recorder_denied", "reason": "held", "holder": "d1"})
        );
    }

    #[test_timeout::timeout]
    fn roster_update_inlines_roster_fields() {
        let roster = Roster {
            controller: Some("d1".into()),
            lease_holder: None,
            participants: vec!["p1".into()],
            counts: crate::rooms::RosterCounts {
                controller: 1,
                participant: 1,
                connections: 2,
            },
        };
        let value = serde_json::to_value(ServerMessage::RosterUpdate(roster)).unwrap();
        assert_eq!(value["type"], "roster_update");
        assert_eq!(value["controller"], "d1");
        assert_eq!(value["lease_holder"], Value::Null);
        assert_eq!(value["counts"]["connections"], 2);
    }
}
