use std::sync::Arc;

use anyhow::anyhow;
use uuid::Uuid;

use aperture_db::Database;
use aperture_db::queries::format_timestamp;
use aperture_types::api::{MessagePayload, parse_timestamp};
use aperture_types::events::{ErrorPayload, OutboundFrame};

use crate::router::GroupRouter;

/// A raw inbound message before validation. The conversation is supplied by
/// the caller (session scope or REST path), never trusted from the payload.
#[derive(Debug, Default)]
pub struct MessageDraft {
    pub text: Option<String>,
    pub attachment: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Malformed payload or sender not currently a participant. Reported to
    /// the sender only; nothing is persisted or broadcast.
    #[error("message rejected")]
    Validation(ErrorPayload),

    /// The store failed mid-ingest. The sender is told to resend; there is no
    /// automatic retry.
    #[error("message could not be persisted: {0}")]
    Persistence(anyhow::Error),
}

impl IngestError {
    pub fn into_payload(self) -> ErrorPayload {
        match self {
            Self::Validation(payload) => payload,
            Self::Persistence(_) => {
                ErrorPayload::field("non_field_errors", "Message could not be saved. Please resend.")
            }
        }
    }
}

/// Validate, persist, and broadcast one inbound message.
///
/// Every step is a hard gate: schema check, then a fresh membership check
/// (participant lists can change mid-session, so connect-time authorization
/// is not reused), then persistence, then group fan-out. The returned payload
/// is exactly what every subscriber — the sender's session included — sees.
pub async fn ingest(
    db: &Arc<Database>,
    router: &GroupRouter,
    conversation_id: Uuid,
    sender_id: Uuid,
    sender_username: &str,
    draft: MessageDraft,
) -> Result<MessagePayload, IngestError> {
    let text = draft.text.unwrap_or_default();
    if text.is_empty() && draft.attachment.is_none() {
        return Err(IngestError::Validation(ErrorPayload::field(
            "text",
            "This field may not be blank.",
        )));
    }

    let member = {
        let db = db.clone();
        let convo = conversation_id.to_string();
        let sender = sender_id.to_string();
        tokio::task::spawn_blocking(move || db.is_participant(&convo, &sender))
            .await
            .map_err(|e| IngestError::Persistence(anyhow!("join error: {}", e)))?
            .map_err(IngestError::Persistence)?
    };
    if !member {
        return Err(IngestError::Validation(ErrorPayload::field(
            "conversation",
            "Not a participant in this conversation.",
        )));
    }

    let message_id = Uuid::new_v4();
    let created_at = format_timestamp(chrono::Utc::now());
    {
        let db = db.clone();
        let mid = message_id.to_string();
        let convo = conversation_id.to_string();
        let sender = sender_id.to_string();
        let text = text.clone();
        let attachment = draft.attachment.clone();
        let ts = created_at.clone();
        tokio::task::spawn_blocking(move || {
            db.insert_message(&mid, &convo, &sender, &text, attachment.as_deref(), &ts)
        })
        .await
        .map_err(|e| IngestError::Persistence(anyhow!("join error: {}", e)))?
        .map_err(IngestError::Persistence)?;
    }

    let payload = MessagePayload {
        id: message_id,
        conversation: conversation_id,
        sender_id,
        sender_username: sender_username.to_string(),
        text,
        attachment: draft.attachment,
        timestamp: parse_timestamp(&created_at),
        read_receipts: vec![],
    };

    router
        .broadcast(conversation_id, OutboundFrame::Message(payload.clone()))
        .await;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::sync::mpsc;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open(Path::new(":memory:")).unwrap())
    }

    fn seed(db: &Database) -> (Uuid, Uuid, Uuid) {
        let convo = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.ensure_user(&alice.to_string(), "alice").unwrap();
        db.ensure_user(&bob.to_string(), "bob").unwrap();
        db.create_conversation(
            &convo.to_string(),
            [alice.to_string().as_str(), bob.to_string().as_str()],
            "2026-01-01T00:00:00.000000Z",
        )
        .unwrap();
        (convo, alice, bob)
    }

    fn draft(text: &str) -> MessageDraft {
        MessageDraft {
            text: Some(text.to_string()),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn rejects_blank_text_without_attachment() {
        let db = test_db();
        let router = GroupRouter::new();
        let (convo, alice, _) = seed(&db);

        let err = ingest(&db, &router, convo, alice, "alice", MessageDraft::default())
            .await
            .unwrap_err();
        let payload = err.into_payload();
        assert!(payload.errors.contains_key("text"));
        assert!(db.get_messages(&convo.to_string(), 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn allows_blank_text_with_attachment() {
        let db = test_db();
        let router = GroupRouter::new();
        let (convo, alice, _) = seed(&db);

        let msg = ingest(
            &db,
            &router,
            convo,
            alice,
            "alice",
            MessageDraft {
                text: None,
                attachment: Some("chat/attachments/photo.jpg".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(msg.text, "");
        assert_eq!(msg.attachment.as_deref(), Some("chat/attachments/photo.jpg"));
    }

    #[tokio::test]
    async fn rejects_non_participant_and_broadcasts_nothing() {
        let db = test_db();
        let router = GroupRouter::new();
        let (convo, _, _) = seed(&db);
        let outsider = Uuid::new_v4();
        db.ensure_user(&outsider.to_string(), "mallory").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.join(convo, Uuid::new_v4(), tx).await;

        let err = ingest(&db, &router, convo, outsider, "mallory", draft("hi"))
            .await
            .unwrap_err();
        let payload = err.into_payload();
        assert_eq!(
            payload.errors["conversation"][0],
            "Not a participant in this conversation."
        );

        // Nothing persisted, nothing delivered.
        assert!(db.get_messages(&convo.to_string(), 10).unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn persists_and_fans_out_to_all_sessions() {
        let db = test_db();
        let router = GroupRouter::new();
        let (convo, alice, _) = seed(&db);

        // Two live sessions on the group: the sender's own and the peer's.
        let (tx_sender, mut rx_sender) = mpsc::unbounded_channel();
        let (tx_peer, mut rx_peer) = mpsc::unbounded_channel();
        router.join(convo, Uuid::new_v4(), tx_sender).await;
        router.join(convo, Uuid::new_v4(), tx_peer).await;

        let msg = ingest(&db, &router, convo, alice, "alice", draft("hi"))
            .await
            .unwrap();
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.sender_username, "alice");
        assert!(msg.read_receipts.is_empty());

        let rows = db.get_messages(&convo.to_string(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "hi");
        assert_eq!(rows[0].sender_id, alice.to_string());

        // Echo: the sender's session gets exactly one copy, identical to the
        // peer's copy.
        let echoed = rx_sender.recv().await.unwrap();
        let peer_copy = rx_peer.recv().await.unwrap();
        assert_eq!(
            serde_json::to_string(&*echoed).unwrap(),
            serde_json::to_string(&*peer_copy).unwrap()
        );
        assert!(rx_sender.try_recv().is_err());

        let frame = serde_json::to_value(&*echoed).unwrap();
        assert_eq!(frame["id"], msg.id.to_string());
        assert_eq!(frame["text"], "hi");
    }
}
