use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use aperture_db::models::{MessageRow, ParticipantRow, ReadReceiptRow};
use aperture_types::api::{MessagePayload, ParticipantResponse, ReadReceiptResponse, parse_timestamp};

pub fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

/// Group read-receipt rows by message id, shaped for the wire.
pub fn group_receipts(rows: Vec<ReadReceiptRow>) -> HashMap<String, Vec<ReadReceiptResponse>> {
    let mut grouped: HashMap<String, Vec<ReadReceiptResponse>> = HashMap::new();
    for row in rows {
        grouped
            .entry(row.message_id.clone())
            .or_default()
            .push(ReadReceiptResponse {
                user_id: parse_uuid(&row.user_id, "user_id"),
                username: row.username,
                read_at: parse_timestamp(&row.read_at),
            });
    }
    grouped
}

pub fn shape_message(row: MessageRow, read_receipts: Vec<ReadReceiptResponse>) -> MessagePayload {
    MessagePayload {
        id: parse_uuid(&row.id, "message id"),
        conversation: parse_uuid(&row.conversation_id, "conversation_id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        sender_username: row.sender_username,
        text: row.text,
        attachment: row.attachment,
        timestamp: parse_timestamp(&row.created_at),
        read_receipts,
    }
}

pub fn shape_participant(row: ParticipantRow) -> ParticipantResponse {
    ParticipantResponse {
        user_id: parse_uuid(&row.user_id, "user_id"),
        username: row.username,
        last_read_at: parse_timestamp(&row.last_read_at),
        is_muted: row.is_muted,
    }
}
