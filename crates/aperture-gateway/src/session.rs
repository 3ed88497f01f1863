use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use aperture_db::Database;
use aperture_types::api::Claims;
use aperture_types::events::{ErrorPayload, InboundMessage, OutboundFrame};

use crate::ingest::{self, MessageDraft};
use crate::router::GroupRouter;

/// One chat connection moves through four phases: connecting (credential
/// extracted from the query string and verified), authorizing (conversation
/// looked up, membership checked), open (the event loop in [`run`]), and
/// closed. The first two run in [`authorize`] *before* the WebSocket upgrade
/// is accepted, so a rejected client never sees an open socket.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing or invalid credential")]
    Unauthenticated,

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("not a participant in this conversation")]
    NotParticipant,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Resolve the bearer token and check conversation membership. The token
/// arrives in a query parameter because the browser WebSocket API cannot set
/// an Authorization header at handshake time.
pub async fn authorize(
    db: &Arc<Database>,
    jwt_secret: &str,
    conversation_id: Uuid,
    token: Option<&str>,
) -> Result<SessionContext, HandshakeError> {
    let token = token.ok_or(HandshakeError::Unauthenticated)?;
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| HandshakeError::Unauthenticated)?
    .claims;

    let (found, member) = {
        let db = db.clone();
        let convo = conversation_id.to_string();
        let user_id = claims.sub.to_string();
        let username = claims.username.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<(bool, bool)> {
            db.ensure_user(&user_id, &username)?;
            let found = db.get_conversation(&convo)?.is_some();
            let member = found && db.is_participant(&convo, &user_id)?;
            Ok((found, member))
        })
        .await
        .map_err(|e| HandshakeError::Store(anyhow::anyhow!("join error: {}", e)))??
    };

    if !found {
        return Err(HandshakeError::ConversationNotFound);
    }
    if !member {
        return Err(HandshakeError::NotParticipant);
    }

    Ok(SessionContext {
        conversation_id,
        user_id: claims.sub,
        username: claims.username,
    })
}

/// The open phase of a session: register with the broadcast group, then pump
/// frames both ways until either half of the socket dies. Deregistration runs
/// unconditionally afterwards — it must not depend on a graceful close frame.
pub async fn run(socket: WebSocket, router: GroupRouter, db: Arc<Database>, ctx: SessionContext) {
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<OutboundFrame>>();

    router.join(ctx.conversation_id, session_id, tx.clone()).await;
    info!(
        "{} ({}) joined chat {}",
        ctx.username, ctx.user_id, ctx.conversation_id
    );

    let (mut sender, mut receiver) = socket.split();

    // Forward queued frames (group broadcasts and this session's own error
    // payloads) to the client.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&*frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unserializable frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Read inbound payloads and push them through the ingest pipeline.
    // Failures go back on this session's own queue, never to the group.
    let recv_router = router.clone();
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let draft = match serde_json::from_str::<InboundMessage>(&text) {
                        Ok(inbound) => MessageDraft {
                            text: inbound.text,
                            attachment: None,
                        },
                        Err(e) => {
                            warn!(
                                "{} ({}) sent a malformed payload: {}",
                                recv_ctx.username, recv_ctx.user_id, e
                            );
                            let err = ErrorPayload::field(
                                "non_field_errors",
                                "Malformed message payload.",
                            );
                            let _ = tx.send(Arc::new(OutboundFrame::Error(err)));
                            continue;
                        }
                    };

                    if let Err(err) = ingest::ingest(
                        &db,
                        &recv_router,
                        recv_ctx.conversation_id,
                        recv_ctx.user_id,
                        &recv_ctx.username,
                        draft,
                    )
                    .await
                    {
                        let _ = tx.send(Arc::new(OutboundFrame::Error(err.into_payload())));
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever half finishes first tears the other down; an abrupt drop of
    // the TCP stream lands here the same way a clean close does.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    router.leave(ctx.conversation_id, session_id).await;
    info!(
        "{} ({}) left chat {}",
        ctx.username, ctx.user_id, ctx.conversation_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SECRET: &str = "test-secret";

    fn make_token(sub: Uuid, username: &str, minutes_from_now: i64) -> String {
        use jsonwebtoken::{EncodingKey, Header, encode};
        let claims = Claims {
            sub,
            username: username.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::minutes(minutes_from_now)).timestamp()
                as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

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

    #[tokio::test]
    async fn rejects_missing_and_garbage_tokens() {
        let db = test_db();
        let (convo, _, _) = seed(&db);

        let err = authorize(&db, SECRET, convo, None).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Unauthenticated));

        let err = authorize(&db, SECRET, convo, Some("not-a-jwt"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Unauthenticated));
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let db = test_db();
        let (convo, alice, _) = seed(&db);

        let stale = make_token(alice, "alice", -120);
        let err = authorize(&db, SECRET, convo, Some(stale.as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Unauthenticated));
    }

    #[tokio::test]
    async fn rejects_unknown_conversation() {
        let db = test_db();
        seed(&db);
        let stranger = Uuid::new_v4();

        let token = make_token(stranger, "carol", 30);
        let err = authorize(&db, SECRET, Uuid::new_v4(), Some(token.as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ConversationNotFound));
    }

    #[tokio::test]
    async fn rejects_non_participant() {
        let db = test_db();
        let (convo, _, _) = seed(&db);
        let outsider = Uuid::new_v4();

        let token = make_token(outsider, "mallory", 30);
        let err = authorize(&db, SECRET, convo, Some(token.as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::NotParticipant));
    }

    #[tokio::test]
    async fn two_party_chat_end_to_end() {
        use crate::ingest::{self, MessageDraft};
        use crate::router::GroupRouter;
        use tokio::sync::mpsc;

        let db = test_db();
        let router = GroupRouter::new();
        let (convo, alice, bob) = seed(&db);

        // Both participants clear the handshake; an outsider does not.
        let a = authorize(&db, SECRET, convo, Some(make_token(alice, "alice", 30).as_str()))
            .await
            .unwrap();
        let b = authorize(&db, SECRET, convo, Some(make_token(bob, "bob", 30).as_str()))
            .await
            .unwrap();
        assert_eq!(b.user_id, bob);
        let carol = Uuid::new_v4();
        assert!(
            authorize(&db, SECRET, convo, Some(make_token(carol, "carol", 30).as_str()))
                .await
                .is_err()
        );

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        router.join(convo, Uuid::new_v4(), tx_a).await;
        router.join(convo, Uuid::new_v4(), tx_b).await;

        let sent = ingest::ingest(
            &db,
            &router,
            a.conversation_id,
            a.user_id,
            &a.username,
            MessageDraft {
                text: Some("hi".to_string()),
                attachment: None,
            },
        )
        .await
        .unwrap();

        // Exactly one persisted message, delivered once to each session.
        let rows = db.get_messages(&convo.to_string(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sender_id, a.user_id.to_string());

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.unwrap();
            let value = serde_json::to_value(&*frame).unwrap();
            assert_eq!(value["id"], sent.id.to_string());
            assert_eq!(value["text"], "hi");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn accepts_participant_and_provisions_identity() {
        let db = test_db();
        let (convo, alice, _) = seed(&db);

        let token = make_token(alice, "alice", 30);
        let ctx = authorize(&db, SECRET, convo, Some(token.as_str())).await.unwrap();
        assert_eq!(ctx.conversation_id, convo);
        assert_eq!(ctx.user_id, alice);
        assert_eq!(ctx.username, "alice");

        // The claims upsert keeps the identity row current.
        let row = db.get_user_by_id(&alice.to_string()).unwrap().unwrap();
        assert_eq!(row.username, "alice");
    }
}
