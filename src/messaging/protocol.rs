//! Wire format shared by the controller and its workers.
//!
//! Every frame is a length-prefixed JSON envelope. Requests that expect a
//! reply carry `response: true`; the reply reuses the request's `__msgId`
//! under the `messaging:response` name.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use uuid::Uuid;

use crate::error::SlicerError;

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Message names understood by both sides.
pub mod names {
    pub const RESPONSE: &str = "messaging:response";
    pub const PING: &str = "messaging:ping";
    pub const CONNECT: &str = "client:connect";
    pub const CLIENT_AVAILABLE: &str = "client:available";
    pub const CLIENT_UNAVAILABLE: &str = "client:unavailable";
    pub const WORKER_READY: &str = "worker:ready";
    pub const SLICE_NEW: &str = "slicer:slice:new";
    pub const SLICE_COMPLETE: &str = "worker:slice:complete";
    pub const EXECUTION_FINISHED: &str = "execution:finished";
}

/// Connection state of a client as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Online,
    Available,
    Unavailable,
    /// Socket closed; the client may still reconnect
    Disconnected,
    /// Did not reconnect in time
    Offline,
}

impl ClientState {
    /// True while the client has a live connection.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientState::Online | ClientState::Available | ClientState::Unavailable
        )
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Online => write!(f, "online"),
            ClientState::Available => write!(f, "available"),
            ClientState::Unavailable => write!(f, "unavailable"),
            ClientState::Disconnected => write!(f, "disconnected"),
            ClientState::Offline => write!(f, "offline"),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    #[serde(rename = "__msgId")]
    pub msg_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub volatile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// A message the sender will wait on a response for.
    pub fn request(message: impl Into<String>, payload: Value) -> Self {
        Self {
            message: message.into(),
            msg_id: Uuid::new_v4().to_string(),
            payload,
            response: true,
            volatile: false,
            error: None,
        }
    }

    /// Fire-and-forget message.
    pub fn volatile(message: impl Into<String>, payload: Value) -> Self {
        Self {
            message: message.into(),
            msg_id: Uuid::new_v4().to_string(),
            payload,
            response: false,
            volatile: true,
            error: None,
        }
    }

    pub fn respond(&self, payload: Value) -> Self {
        Self {
            message: names::RESPONSE.to_string(),
            msg_id: self.msg_id.clone(),
            payload,
            response: false,
            volatile: false,
            error: None,
        }
    }

    pub fn respond_error(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.respond(Value::Null)
        }
    }

    pub fn is_response(&self) -> bool {
        self.message == names::RESPONSE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    #[serde(rename = "willProcess")]
    pub will_process: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecorded {
    pub recorded: bool,
    pub slice_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFinished {
    pub ex_id: String,
}

/// Length-delimited JSON framing for [`Message`].
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = SlicerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, SlicerError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = SlicerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), SlicerError> {
        let body = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = Message::request(names::SLICE_NEW, json!({"slice_id": "s1"}));
        let raw = serde_json::to_value(&msg).unwrap();
        assert_eq!(raw["message"], "slicer:slice:new");
        assert_eq!(raw["response"], true);
        assert!(raw.get("__msgId").is_some());
        assert!(raw.get("volatile").is_none());
        assert!(raw.get("error").is_none());
    }

    #[test]
    fn response_reuses_message_id() {
        let msg = Message::request(names::PING, Value::Null);
        let reply = msg.respond(json!({"ok": true}));
        assert!(reply.is_response());
        assert_eq!(reply.msg_id, msg.msg_id);
        assert!(!reply.response);

        let failure = msg.respond_error("boom");
        assert_eq!(failure.error.as_deref(), Some("boom"));
        assert_eq!(failure.msg_id, msg.msg_id);
    }

    #[test]
    fn dispatch_response_field_name() {
        let raw = serde_json::to_string(&DispatchResponse { will_process: true }).unwrap();
        assert_eq!(raw, r#"{"willProcess":true}"#);
    }

    #[test]
    fn codec_decodes_partial_frames() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let msg = Message::volatile(names::WORKER_READY, json!({"worker_id": "w1"}));
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn connected_states() {
        assert!(ClientState::Available.is_connected());
        assert!(ClientState::Unavailable.is_connected());
        assert!(!ClientState::Disconnected.is_connected());
        assert!(!ClientState::Offline.is_connected());
    }
}
