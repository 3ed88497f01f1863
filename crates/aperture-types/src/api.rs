use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims shared across aperture-api (REST middleware) and
/// aperture-gateway (WebSocket handshake). Canonical definition lives here in
/// aperture-types to eliminate duplication. Tokens are issued by an external
/// identity service; this server only decodes and verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantResponse {
    pub user_id: Uuid,
    pub username: String,
    pub last_read_at: DateTime<Utc>,
    pub is_muted: bool,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub participants: Vec<ParticipantResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message: Option<MessagePayload>,
    pub unread_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuteRequest {
    pub is_muted: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: Option<String>,
    pub attachment: Option<String>,
}

/// The shaped message as it appears on the wire — returned from the REST
/// surface and broadcast verbatim over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub conversation: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub text: String,
    pub attachment: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub read_receipts: Vec<ReadReceiptResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptResponse {
    pub user_id: Uuid,
    pub username: String,
    pub read_at: DateTime<Utc>,
}

/// Parse a timestamp string coming out of SQLite. Rows written by this server
/// are RFC 3339, but SQLite column defaults produce "YYYY-MM-DD HH:MM:SS"
/// without a timezone, so fall back to parsing that as naive UTC.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}
