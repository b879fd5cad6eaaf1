//! HTTP surface: the SSE push endpoint, mutation routes that notify
//! the engine after every successful write, heartbeat acks, and a demo
//! generation route that drives the streaming relay.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use agora_sync::{
    Being, BeingKind, ConnectParams, ErrorFrame, Intention, IntentionStatus, Model, SinceMarker,
    SpaceId, SpaceStore, StreamOutcome, SyncEngine, SyncError, WireFrame,
};

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/spaces/:space_id/events", get(space_events))
        .route(
            "/spaces/:space_id/connections/:connection_id/heartbeat",
            post(heartbeat),
        )
        .route("/spaces/:space_id/beings", post(create_being))
        .route("/beings/:id", patch(update_being).delete(delete_being))
        .route("/spaces/:space_id/intentions", post(create_intention))
        .route("/intentions/:id/status", patch(update_intention_status))
        .route("/intentions/:id", delete(delete_intention))
        .route("/intentions/:id/generate", post(generate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Query parameters of the push endpoint.
#[derive(Debug, Deserialize)]
pub struct EventsParams {
    /// Comma-separated model names; absent means all.
    pub types: Option<String>,
    /// Catch-up marker: unix milliseconds or `v<version>`.
    pub since: Option<String>,
    /// Resolved caller identity. Stands in for the credential
    /// resolution an auth layer would perform.
    pub identity: Option<Uuid>,
}

/// Parse the `types` filter into a model set; unknown names are
/// skipped, an absent or empty filter means all models.
pub fn parse_types(raw: Option<&str>) -> Vec<Model> {
    raw.map(|s| s.split(',').filter_map(Model::parse).collect())
        .unwrap_or_default()
}

/// Stand-in for the session collaborator: resolves request credentials
/// to a caller identity. The demo trusts a bare `identity` parameter;
/// a real deployment swaps in token validation here.
fn resolve_caller(params: &EventsParams) -> Option<Uuid> {
    params.identity
}

/// First SSE event on every stream: tells the client its connection id
/// so it can ack heartbeats out-of-band.
#[derive(Debug, Serialize)]
struct WelcomeEvent {
    r#type: &'static str,
    connection: Uuid,
    space: SpaceId,
}

/// GET /spaces/:space_id/events, the long-lived push stream.
async fn space_events(
    State(state): State<Arc<AppState>>,
    Path(space_id): Path<Uuid>,
    Query(params): Query<EventsParams>,
) -> Response {
    let mut connect = ConnectParams::new(space_id).with_models(parse_types(params.types.as_deref()));
    if let Some(identity) = resolve_caller(&params) {
        connect = connect.with_identity(identity);
    }
    if let Some(marker) = params.since.as_deref().and_then(SinceMarker::parse) {
        connect = connect.with_since(marker);
    }

    let handle = match state.engine.connect(connect).await {
        Ok(handle) => handle,
        Err(e) => {
            // One error frame, then the connection closes. Other
            // connections and spaces are unaffected.
            log::warn!("Connect to space {space_id} failed: {e}");
            let frame = ErrorFrame::new(e.to_string());
            let stream =
                tokio_stream::once(Ok::<_, Infallible>(Event::default().data(frame.encode())));
            return Sse::new(stream).into_response();
        }
    };

    let welcome = WelcomeEvent {
        r#type: "welcome",
        connection: handle.connection_id,
        space: space_id,
    };
    let engine = state.engine.clone();
    let stream = async_stream::stream! {
        let mut handle = handle;
        let _guard = DisconnectGuard {
            engine,
            connection_id: handle.connection_id,
        };
        yield Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&welcome).unwrap_or_default()),
        );
        loop {
            match handle.frames.recv().await {
                Some(WireFrame::Data(json)) => yield Ok(Event::default().data(json)),
                Some(WireFrame::Heartbeat) => yield Ok(Event::default().comment("heartbeat")),
                None => break,
            }
        }
    };

    Sse::new(stream).into_response()
}

/// Deregisters the connection when the response stream is dropped
/// (client closed the tab, proxy cut the socket).
struct DisconnectGuard {
    engine: Arc<SyncEngine>,
    connection_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        let id = self.connection_id;
        tokio::spawn(async move {
            engine.disconnect(id).await;
        });
    }
}

/// POST /spaces/:space_id/connections/:connection_id/heartbeat
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path((_space_id, connection_id)): Path<(Uuid, Uuid)>,
) -> StatusCode {
    if state.engine.heartbeat_ack(connection_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBeingRequest {
    pub name: String,
    pub kind: BeingKind,
    pub owner: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

async fn create_being(
    State(state): State<Arc<AppState>>,
    Path(space_id): Path<Uuid>,
    Json(req): Json<CreateBeingRequest>,
) -> Result<Response, Response> {
    let mut being = Being::new(req.name, req.kind, space_id);
    being.owner = req.owner;
    if let Some(metadata) = req.metadata {
        being.metadata = metadata;
    }
    let being = state
        .engine
        .create_being(being)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(being)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateBeingRequest {
    pub name: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

async fn update_being(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBeingRequest>,
) -> Result<Response, Response> {
    let mut being = state
        .store
        .being(id)
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| error_response(SyncError::UnknownBeing(id)))?;
    if let Some(name) = req.name {
        being.name = name;
    }
    if let Some(metadata) = req.metadata {
        being.metadata = metadata;
    }
    let being = state
        .engine
        .update_being(being)
        .await
        .map_err(error_response)?;
    Ok(Json(being).into_response())
}

async fn delete_being(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Response> {
    state
        .engine
        .delete_being(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateIntentionRequest {
    pub kind: String,
    pub content: Option<Vec<String>>,
    pub owner: Option<Uuid>,
}

async fn create_intention(
    State(state): State<Arc<AppState>>,
    Path(space_id): Path<Uuid>,
    Json(req): Json<CreateIntentionRequest>,
) -> Result<Response, Response> {
    let mut intention = Intention::new(req.kind, space_id);
    intention.owner = req.owner;
    if let Some(content) = req.content {
        intention.content = content;
    }
    let intention = state
        .engine
        .create_intention(intention)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(intention)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: IntentionStatus,
}

async fn update_intention_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Response, Response> {
    let intention = state
        .engine
        .update_intention_status(id, req.status)
        .await
        .map_err(error_response)?;
    Ok(Json(intention).into_response())
}

async fn delete_intention(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Response> {
    state
        .engine
        .delete_intention(id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Demo generation backend: streams the supplied tokens through the
/// relay, then finalizes. When `fail` is set it finalizes as `failed`
/// with the given reason, mimicking an upstream error.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub tokens: Vec<String>,
    pub delay_ms: Option<u64>,
    pub fail: Option<String>,
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<GenerateRequest>,
) -> Result<StatusCode, Response> {
    let intention = state
        .store
        .intention(id)
        .map_err(|e| error_response(e.into()))?
        .ok_or_else(|| error_response(SyncError::UnknownIntention(id)))?;
    if intention.status.is_terminal() {
        return Err(error_response(SyncError::AlreadyFinalized(id)));
    }
    if intention.status == IntentionStatus::Draft {
        state
            .engine
            .update_intention_status(id, IntentionStatus::Active)
            .await
            .map_err(error_response)?;
    }

    let engine = state.engine.clone();
    let delay = Duration::from_millis(req.delay_ms.unwrap_or(50));
    tokio::spawn(async move {
        for token in &req.tokens {
            if let Err(e) = engine.append_token(id, token).await {
                log::error!("Token append for intention {id} failed: {e}");
                break;
            }
            tokio::time::sleep(delay).await;
        }
        let (outcome, message) = match req.fail {
            Some(reason) => (StreamOutcome::Failed, Some(reason)),
            None => (StreamOutcome::Complete, None),
        };
        if let Err(e) = engine.finalize_intention(id, outcome, message).await {
            log::error!("Finalize for intention {id} failed: {e}");
        }
    });

    Ok(StatusCode::ACCEPTED)
}

fn error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::UnknownIntention(_)
        | SyncError::UnknownBeing(_)
        | SyncError::UnknownConnection(_) => StatusCode::NOT_FOUND,
        SyncError::InvalidTransition { .. } | SyncError::AlreadyFinalized(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": true, "message": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types_filter() {
        assert_eq!(parse_types(None), vec![]);
        assert_eq!(parse_types(Some("beings")), vec![Model::Beings]);
        assert_eq!(
            parse_types(Some("beings,intentions")),
            vec![Model::Beings, Model::Intentions]
        );
        // Unknown names are skipped, not errors.
        assert_eq!(parse_types(Some("beings,widgets")), vec![Model::Beings]);
        assert_eq!(parse_types(Some("")), vec![]);
    }

    #[test]
    fn test_welcome_event_shape() {
        let welcome = WelcomeEvent {
            r#type: "welcome",
            connection: Uuid::nil(),
            space: Uuid::nil(),
        };
        let json = serde_json::to_value(&welcome).unwrap();
        assert_eq!(json["type"], "welcome");
        assert!(json["connection"].is_string());
    }
}
