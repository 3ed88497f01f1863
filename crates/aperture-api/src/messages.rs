use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use aperture_db::queries::format_timestamp;
use aperture_gateway::ingest::{self, IngestError, MessageDraft};
use aperture_types::api::{Claims, MessagePayload, SendMessageRequest};

use crate::AppState;
use crate::shape::{group_receipts, shape_message};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Messages for a conversation in chronological order (the newest `limit`
/// window). Participants only.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let user_id = claims.sub.to_string();
    let limit = query.limit.min(200);

    let (rows, receipt_rows) = tokio::task::spawn_blocking(move || {
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

        let rows = db
            .get_messages(&cid, limit)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let receipt_rows = db
            .get_read_receipts_for_messages(&message_ids)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        Ok::<_, StatusCode>((rows, receipt_rows))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })??;

    let mut grouped: HashMap<String, Vec<_>> = group_receipts(receipt_rows);
    let mut messages: Vec<MessagePayload> = rows
        .into_iter()
        .map(|row| {
            let receipts = grouped.remove(&row.id).unwrap_or_default();
            shape_message(row, receipts)
        })
        .collect();
    // Rows come newest-first from the store.
    messages.reverse();

    Ok(Json(messages))
}

/// Send a message over the REST surface. Runs the same ingest pipeline as the
/// WebSocket path, so connected sessions see the broadcast either way.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, Response> {
    {
        let db = state.db.clone();
        let cid = conversation_id.to_string();
        let found = tokio::task::spawn_blocking(move || db.get_conversation(&cid))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())?
            .is_some();
        if !found {
            return Err(StatusCode::NOT_FOUND.into_response());
        }
    }

    let draft = MessageDraft {
        text: req.text,
        attachment: req.attachment,
    };

    match ingest::ingest(
        &state.db,
        &state.router,
        conversation_id,
        claims.sub,
        &claims.username,
        draft,
    )
    .await
    {
        Ok(payload) => Ok((StatusCode::CREATED, Json(payload))),
        Err(IngestError::Validation(errors)) => {
            Err((StatusCode::BAD_REQUEST, Json(errors)).into_response())
        }
        Err(IngestError::Persistence(e)) => {
            error!("message persistence failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Record that the caller has read a message. Append-only and idempotent:
/// re-marking an already-read message is a no-op, not an error.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let mid = message_id.to_string();
    let user_id = claims.sub.to_string();
    let receipt_id = Uuid::new_v4().to_string();
    let now = format_timestamp(chrono::Utc::now());

    tokio::task::spawn_blocking(move || {
        let message = db
            .get_message(&mid)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::NOT_FOUND)?;
        if !db
            .is_participant(&message.conversation_id, &user_id)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        {
            return Err(StatusCode::FORBIDDEN);
        }
        db.mark_read(&receipt_id, &mid, &user_id, &now)
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
