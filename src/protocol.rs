//! Wire envelope: `{"type": <TAG>, "payload": <tag-specific>}`.
//!
//! Inbound frames are validated once here. A known tag with the wrong payload
//! shape is a decode error; an unknown tag decodes to `None` and is skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeErr;

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Inbound {
    /// Offset in milliseconds.
    Seek(i64),
    /// Offset in milliseconds. Same shape as `Seek`, distinct tag.
    Skip(i64),
    /// Free-form playback state.
    Playback(String),
    /// Target room id; `""` leaves the current room.
    ChangeRoom(String),
    Chat(ChatInput),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInput {
    pub sender_name: String,
    pub message: String,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    SocketId(String),
    Seek(i64),
    Skip(i64),
    Playback(String),
    /// Full chat log of the room, used for live updates and for replay.
    Chat(Vec<ChatMessage>),
}

impl Outbound {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "senderID")]
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Decode one text frame. `Ok(None)` means the tag is not one we know.
pub fn decode(raw: &str) -> Result<Option<Inbound>, DecodeErr> {
    let env: RawEnvelope = serde_json::from_str(raw)?;
    let msg = match env.kind.as_str() {
        "SEEK"        => Inbound::Seek(offset("SEEK", env.payload)?),
        "SKIP"        => Inbound::Skip(offset("SKIP", env.payload)?),
        "PLAYBACK"    => Inbound::Playback(string("PLAYBACK", env.payload)?),
        "CHANGE_ROOM" => Inbound::ChangeRoom(string("CHANGE_ROOM", env.payload)?),
        "CHAT"        => Inbound::Chat(serde_json::from_value(env.payload).map_err(|_| {
            DecodeErr::Payload { kind: "CHAT", expected: "object {senderName, message}" }
        })?),
        _ => return Ok(None),
    };
    Ok(Some(msg))
}

// fractional offsets truncate toward zero
fn offset(kind: &'static str, v: Value) -> Result<i64, DecodeErr> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or(DecodeErr::Payload { kind, expected: "integer" }),
        _ => Err(DecodeErr::Payload { kind, expected: "integer" }),
    }
}

fn string(kind: &'static str, v: Value) -> Result<String, DecodeErr> {
    match v {
        Value::String(s) => Ok(s),
        _ => Err(DecodeErr::Payload { kind, expected: "string" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_shapes_survive_encode_decode() {
        let samples = [
            Inbound::Seek(90_500),
            Inbound::Skip(-3),
            Inbound::Playback("paused:track-4".into()),
            Inbound::ChangeRoom("".into()),
            Inbound::Chat(ChatInput { sender_name: "alice".into(), message: "hi".into() }),
        ];
        for msg in samples {
            let raw = serde_json::to_string(&msg).unwrap();
            assert_eq!(decode(&raw).unwrap(), Some(msg));
        }
    }

    #[test]
    fn wire_tags_match_protocol() {
        let v = serde_json::to_value(Inbound::ChangeRoom("r1".into())).unwrap();
        assert_eq!(v, json!({"type": "CHANGE_ROOM", "payload": "r1"}));

        let v: Value = serde_json::from_str(&Outbound::SocketId("abc".into()).encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "SOCKET_ID", "payload": "abc"}));
    }

    #[test]
    fn chat_message_uses_sender_id_key() {
        let m = ChatMessage {
            sender_id: "s1".into(),
            sender_name: "alice".into(),
            message: "hi".into(),
            timestamp: Utc::now(),
        };
        let v: Value = serde_json::from_str(&Outbound::Chat(vec![m]).encode().unwrap()).unwrap();
        assert_eq!(v["type"], "CHAT");
        assert_eq!(v["payload"][0]["senderID"], "s1");
        assert_eq!(v["payload"][0]["senderName"], "alice");
        assert!(v["payload"][0]["timestamp"].is_string());
    }

    #[test]
    fn fractional_offset_truncates() {
        assert_eq!(decode(r#"{"type":"SEEK","payload":1500.9}"#).unwrap(), Some(Inbound::Seek(1500)));
    }

    #[test]
    fn unknown_tag_is_skipped() {
        assert_eq!(decode(r#"{"type":"DANCE","payload":{"x":1}}"#).unwrap(), None);
    }

    #[test]
    fn payload_mismatch_is_decode_error() {
        assert!(matches!(
            decode(r#"{"type":"SEEK","payload":"soon"}"#),
            Err(DecodeErr::Payload { kind: "SEEK", .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"CHANGE_ROOM"}"#),
            Err(DecodeErr::Payload { kind: "CHANGE_ROOM", .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"CHAT","payload":{"message":"no name"}}"#),
            Err(DecodeErr::Payload { kind: "CHAT", .. })
        ));
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(matches!(decode("not json"), Err(DecodeErr::Json(_))));
        assert!(matches!(decode(r#"{"payload":1}"#), Err(DecodeErr::Json(_))));
    }
}
