// Thin REST surface over the same stores the WebSocket path uses. Lets
// services that are not connected over a socket provision documents and read
// state; mutations to live documents still go through the socket protocol.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tandem_common::types::{DocumentSnapshot, EntityType, PresenceEntry, RealtimeEvent, RoomId};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::engine::CollabEngine;
use crate::error::{ErrorCode, HubError};
use crate::presence::PresenceStore;
use crate::router::EventRouter;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<HubConfig>,
    pub engine: CollabEngine,
    pub presence: PresenceStore,
    pub events: EventRouter,
}

#[derive(Deserialize)]
struct CreateDocumentRequest {
    /// Omitted ids are generated server-side.
    document_id: Option<Uuid>,
    entity_type: EntityType,
    entity_id: String,
    #[serde(default)]
    initial_content: String,
    created_by: Uuid,
}

#[derive(Deserialize)]
struct AddCollaboratorRequest {
    user_id: Uuid,
}

#[derive(Deserialize)]
struct EventHistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct DocumentEnvelope {
    document: DocumentSnapshot,
}

#[derive(Serialize)]
struct EventsEnvelope {
    items: Vec<RealtimeEvent>,
}

#[derive(Serialize)]
struct RoomUsersEnvelope {
    items: Vec<PresenceEntry>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/documents", post(create_document))
        .route("/v1/documents/{id}", get(get_document))
        .route("/v1/documents/{id}/collaborators", post(add_collaborator))
        .route("/v1/documents/{id}/collaborators/{user_id}", delete(remove_collaborator))
        .route("/v1/entities/{entity_id}/events", get(get_event_history))
        .route("/v1/rooms/{room}/users", get(get_room_users))
        .with_state(state)
}

async fn create_document(
    State(state): State<ApiState>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentEnvelope>), HubError> {
    if payload.entity_id.trim().is_empty() {
        return Err(HubError::new(ErrorCode::ValidationFailed, "entity_id must not be empty"));
    }

    let document_id = payload.document_id.unwrap_or_else(Uuid::new_v4);
    let document = state
        .engine
        .create_document(
            document_id,
            payload.entity_type,
            &payload.entity_id,
            &payload.initial_content,
            payload.created_by,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(DocumentEnvelope { document })))
}

async fn get_document(
    State(state): State<ApiState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<DocumentEnvelope>, HubError> {
    let document = state.engine.get_document(document_id).await?;
    Ok(Json(DocumentEnvelope { document }))
}

async fn add_collaborator(
    State(state): State<ApiState>,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<AddCollaboratorRequest>,
) -> Result<StatusCode, HubError> {
    state.engine.add_collaborator(document_id, payload.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_collaborator(
    State(state): State<ApiState>,
    Path((document_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, HubError> {
    state.engine.remove_collaborator(document_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_event_history(
    State(state): State<ApiState>,
    Path(entity_id): Path<String>,
    Query(query): Query<EventHistoryQuery>,
) -> Json<EventsEnvelope> {
    let cap = state.config.event_history_cap;
    let limit = query.limit.unwrap_or(cap).min(cap);
    let items = state.events.get_event_history(&entity_id, limit).await;
    Json(EventsEnvelope { items })
}

async fn get_room_users(
    State(state): State<ApiState>,
    Path(room): Path<String>,
) -> Json<RoomUsersEnvelope> {
    let room = RoomId::from_raw(room);
    let items = state.presence.users_in_room(&room).await;
    Json(RoomUsersEnvelope { items })
}
