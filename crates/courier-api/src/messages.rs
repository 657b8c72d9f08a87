use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use courier_gateway::{GatewayError, SendOutcome, group_reactions};
use courier_types::api::{Claims, HistoryMessage, HistoryQuery, SendMessageRequest, SendMessageResponse};
use courier_types::{MessageId, RoomId};

use crate::AppState;

/// HTTP fallback for sending when the socket is down. Same pipeline as the
/// gateway `Send` command (canonical membership check, idempotency key,
/// persist-then-broadcast); the origin's answer comes back in the response
/// body instead of a targeted event.
pub async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let outcome = state
        .gateway
        .send_from_user(
            claims.user_id(),
            RoomId(room_id),
            req.client_temp_id,
            req.payload,
        )
        .await
        .map_err(status_for)?;

    let (status, duplicate) = match &outcome {
        SendOutcome::Created(_) => (StatusCode::CREATED, false),
        SendOutcome::Duplicate(_) => (StatusCode::OK, true),
    };

    Ok((
        status,
        Json(SendMessageResponse {
            message: outcome.message().clone(),
            duplicate,
        }),
    ))
}

/// Room history, newest first, with grouped reactions. Cursor pagination via
/// `before_id`.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let room_id = RoomId(room_id);
    let user_id = claims.user_id();
    let limit = query.limit.min(200);
    let before_id = query.before_id.map(|id| id.0);

    // Run all blocking DB queries off the async runtime.
    let db = state.db.clone();
    let (rows, reaction_rows) = tokio::task::spawn_blocking(move || {
        let role = db.member_role(&room_id.to_string(), &user_id.to_string())?;
        if role.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }

        let rows = db.get_messages(&room_id.to_string(), limit, before_id)?;
        let message_ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let reaction_rows = db.reactions_for_messages(&message_ids)?;
        Ok(Some((rows, reaction_rows)))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("history query failed: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .ok_or(StatusCode::FORBIDDEN)?;

    // Bucket raw reaction rows per message, then group each bucket.
    let mut per_message: HashMap<i64, Vec<courier_db::models::ReactionRow>> = HashMap::new();
    for row in reaction_rows {
        per_message.entry(row.message_id).or_default().push(row);
    }

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let reactions = per_message
            .remove(&row.id)
            .map(group_reactions)
            .unwrap_or_default();

        let message = row.into_message().map_err(|e| {
            error!("corrupt message row: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        messages.push(HistoryMessage { message, reactions });
    }

    Ok(Json(messages))
}

/// Bulk-read over HTTP, for clients reconciling after reconnect without an
/// open socket.
pub async fn open_room(
    State(state): State<AppState>,
    Path((room_id, up_to)): Path<(Uuid, i64)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let newly_read = state
        .gateway
        .open_room_for_user(claims.user_id(), RoomId(room_id), MessageId(up_to))
        .await
        .map_err(status_for)?;

    Ok(Json(serde_json::json!({ "newly_read": newly_read })))
}

fn status_for(err: GatewayError) -> StatusCode {
    match err {
        GatewayError::Unauthorized => StatusCode::FORBIDDEN,
        GatewayError::UnknownMessage(_) => StatusCode::NOT_FOUND,
        GatewayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        GatewayError::Persistence(e) => {
            error!("persistence failure: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
