use serde::{Deserialize, Serialize};

/// Top-level body of a webhook delivery. Slack sends three shapes to the same
/// endpoint: a `url_verification` handshake, an `event_callback` envelope
/// wrapping the actual event, and (on some workspaces) a bare
/// `assistant_thread_started` payload without the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type", default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    /// Delivery-level identifier, independent of the inner event's own fields.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event: Option<RawEvent>,
    #[serde(default)]
    pub assistant_thread: Option<AssistantThread>,
}

/// The inner event of an `event_callback` envelope. All fields optional: the
/// platform adds and omits fields freely depending on event type and subtype.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub client_msg_id: Option<String>,
    #[serde(default)]
    pub assistant_thread: Option<AssistantThread>,
}

/// Payload of an `assistant_thread_started` event. The channel may be carried
/// directly, inside `context`, or not at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantThread {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub context: ThreadContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadContext {
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ThreadStarted,
    Message,
    Mention,
}

/// One inbound event, normalized from the wire shapes above. Immutable once
/// built. `ts` is an opaque, per-channel monotonic token and is never parsed
/// as a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    /// Delivery-level identifier from the envelope, when present.
    pub event_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub from_bot: bool,
    pub subtype: Option<String>,
    pub client_msg_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a persisted conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_callback_envelope_deserializes() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{
                "type": "event_callback",
                "event_id": "Ev123",
                "event": {
                    "type": "message",
                    "user": "U1",
                    "channel": "D1",
                    "text": "hi",
                    "ts": "100.000200",
                    "channel_type": "im",
                    "unknown_field": {"nested": true}
                }
            }"#,
        )
        .expect("envelope with extra fields should deserialize");
        assert_eq!(payload.event_id.as_deref(), Some("Ev123"));
        let event = payload.event.expect("inner event");
        assert_eq!(event.event_type, "message");
        assert_eq!(event.ts.as_deref(), Some("100.000200"));
        assert!(event.thread_ts.is_none());
    }

    #[test]
    fn bare_assistant_thread_payload_deserializes() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{
                "type": "assistant_thread_started",
                "assistant_thread": {
                    "user_id": "U1",
                    "thread_ts": "T1",
                    "context": {"channel_id": "D9"}
                }
            }"#,
        )
        .expect("bare assistant_thread payload should deserialize");
        let thread = payload.assistant_thread.expect("assistant_thread");
        assert_eq!(thread.channel_id, None);
        assert_eq!(thread.context.channel_id.as_deref(), Some("D9"));
    }

    #[test]
    fn conversation_turn_roundtrip_keeps_role_tag() {
        let turn = ConversationTurn::assistant("hello");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains("\"assistant\""));
        let decoded: ConversationTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, turn);
    }
}
