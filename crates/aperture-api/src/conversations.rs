use std::collections::HashSet;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use aperture_db::models::ParticipantRow;
use aperture_db::queries::format_timestamp;
use aperture_types::api::{
    Claims, ConversationResponse, CreateConversationRequest, MuteRequest, parse_timestamp,
};

use crate::AppState;
use crate::shape::{group_receipts, parse_uuid, shape_message, shape_participant};

/// Create a two-party conversation. Exactly two distinct, already-known user
/// ids are required; the store enforces the two-party invariant again on
/// insert.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let distinct: HashSet<_> = req.participant_ids.iter().collect();
    if req.participant_ids.len() != 2 || distinct.len() != 2 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let conversation_id = Uuid::new_v4();
    let now = format_timestamp(chrono::Utc::now());
    let created_at = parse_timestamp(&now);

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let first = req.participant_ids[0].to_string();
    let second = req.participant_ids[1].to_string();
    let participants: Vec<ParticipantRow> = tokio::task::spawn_blocking(move || {
        for user_id in [&first, &second] {
            if db
                .get_user_by_id(user_id)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
                .is_none()
            {
                return Err(StatusCode::BAD_REQUEST);
            }
        }
        db.create_conversation(&cid, [first.as_str(), second.as_str()], &now)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        db.get_participants(&cid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok((
        StatusCode::CREATED,
        Json(ConversationResponse {
            id: conversation_id,
            participants: participants.into_iter().map(shape_participant).collect(),
            created_at,
            updated_at: created_at,
            last_message: None,
            unread_count: 0,
        }),
    ))
}

/// List the caller's conversations, most recently active first, each with
/// its last message and the caller's unread count.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let shaped = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ConversationResponse>> {
        let rows = db.list_conversations_for_user(&user_id)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = db
                .get_participants(&row.id)?
                .into_iter()
                .map(shape_participant)
                .collect();

            let last_message = match db.last_message(&row.id)? {
                Some(msg) => {
                    let receipts =
                        db.get_read_receipts_for_messages(std::slice::from_ref(&msg.id))?;
                    let mut grouped = group_receipts(receipts);
                    let shaped_receipts = grouped.remove(&msg.id).unwrap_or_default();
                    Some(shape_message(msg, shaped_receipts))
                }
                None => None,
            };

            let unread_count = db.unread_count(&row.id, &user_id)?;

            out.push(ConversationResponse {
                id: parse_uuid(&row.id, "conversation id"),
                participants,
                created_at: parse_timestamp(&row.created_at),
                updated_at: parse_timestamp(&row.updated_at),
                last_message,
                unread_count,
            });
        }
        Ok(out)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(shaped))
}

/// Advance the caller's conversation-level read marker to now. Independent of
/// per-message read receipts, and never moves backwards.
pub async fn read_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let user_id = claims.sub.to_string();
    let now = format_timestamp(chrono::Utc::now());

    tokio::task::spawn_blocking(move || {
        if db
            .get_conversation(&cid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
        if !db
            .is_participant(&cid, &user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }
        db.advance_last_read(&cid, &user_id, &now)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok::<_, StatusCode>(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok(StatusCode::OK)
}

/// Set the caller's mute flag for a conversation.
pub async fn set_mute(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MuteRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let user_id = claims.sub.to_string();
    let is_muted = req.is_muted;

    tokio::task::spawn_blocking(move || {
        if db
            .get_conversation(&cid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .is_none()
        {
            return Err(StatusCode::NOT_FOUND);
        }
        if !db
            .is_participant(&cid, &user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }
        db.set_muted(&cid, &user_id, is_muted)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        Ok::<_, StatusCode>(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    Ok(Json(serde_json::json!({ "is_muted": req.is_muted })))
}
