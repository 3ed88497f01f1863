use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::MessagePayload;

/// Inbound WebSocket payload. The conversation is fixed by the session's
/// scope and the transport cannot carry attachments, so the only field a
/// client can send is `text`. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub text: Option<String>,
}

/// Per-field validation errors, sent back to the offending session only:
/// `{ "errors": { field: [messages] } }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub errors: BTreeMap<String, Vec<String>>,
}

impl ErrorPayload {
    pub fn field(field: &str, message: &str) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), vec![message.to_string()]);
        Self { errors }
    }
}

/// Frames delivered to a connected session. Serializes untagged so the wire
/// sees either the shaped message object or the error object, no envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Message(MessagePayload),
    Error(ErrorPayload),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_wire_shape() {
        let err = ErrorPayload::field("text", "This field may not be blank.");
        let value = serde_json::to_value(OutboundFrame::Error(err)).unwrap();
        assert_eq!(value["errors"]["text"][0], "This field may not be blank.");
    }

    #[test]
    fn inbound_ignores_unknown_fields() {
        let msg: InboundMessage = serde_json::from_str(r#"{"text":"hi","extra":1}"#).unwrap();
        assert_eq!(msg.text.as_deref(), Some("hi"));
    }
}
