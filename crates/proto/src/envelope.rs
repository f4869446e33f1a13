use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ErrorKind;

/// Event names fixed by the routing contract.
///
/// Anything outside this vocabulary is bounced back to the source with an
/// `unknown_event` error envelope.
pub mod events {
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const SEND_CHAT: &str = "send_chat";
    pub const BLUEMAP: &str = "bluemap";
    pub const REGISTER_COMMAND: &str = "register_command";
    pub const UNREGISTER_COMMAND: &str = "unregister_command";
    pub const CLEAR_COMMANDS: &str = "clear_commands";
    pub const BCON_CONFIG: &str = "bcon_config";
    pub const GET_SERVER_INFO: &str = "get_server_info";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ERROR: &str = "error";

    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const PLAYER_JOINED: &str = "player_joined";
    pub const PLAYER_LEFT: &str = "player_left";
    pub const CUSTOM_COMMAND_EXECUTED: &str = "custom_command_executed";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const SERVER_INFO: &str = "server_info";
    pub const SERVER_CONNECTED: &str = "server_connected";
    pub const SERVER_DISCONNECTED: &str = "server_disconnected";
}

/// The message envelope exchanged on every connection.
///
/// Unknown fields are captured in `extra` so pass-through routes forward
/// them untouched; the hub itself only reads the named fields.
///
/// ```
/// use bcon_hub_proto::Envelope;
///
/// let env: Envelope =
///     serde_json::from_str(r#"{"eventType":"send_chat","data":{"message":"hi"},"custom":1}"#)
///         .unwrap();
///
/// assert_eq!(env.event_type, "send_chat");
/// assert_eq!(env.extra.get("custom"), Some(&serde_json::json!(1)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_type: String,
    #[serde(default = "Envelope::empty_data")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    fn empty_data() -> Value {
        json!({})
    }

    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            message_id: None,
            reply_to: None,
            timestamp: None,
            requires_ack: false,
            extra: Map::new(),
        }
    }

    /// Build an `error` reply. `reply_to` carries the offending message id
    /// when the source supplied one.
    pub fn error(kind: ErrorKind, message: &str, reply_to: Option<String>) -> Self {
        let mut env = Self::new(
            events::ERROR,
            json!({ "kind": kind.as_str(), "message": message }),
        );
        env.reply_to = reply_to;
        env
    }

    /// The `data.server_id` field addressing an adapter, if any.
    pub fn server_id(&self) -> Option<&str> {
        self.data.get("server_id").and_then(Value::as_str)
    }

    /// Stamp `data.server_id`. Adapter-sourced envelopes always get the id
    /// from the authenticated principal, so a forged field never survives.
    pub fn set_server_id(&mut self, server_id: &str) {
        if let Value::Object(map) = &mut self.data {
            map.insert("server_id".to_string(), Value::String(server_id.to_string()));
        } else {
            self.data = json!({ "server_id": server_id });
        }
    }
}
