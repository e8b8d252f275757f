use axum::{
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{request::Parts, HeaderValue, Method, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use domain::{Channel, SessionId, User, UserMessage};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

/// 携带会话 id 的请求头
pub const SESSION_HEADER: &str = "x-session-id";

/// 从请求头提取调用方会话
pub struct CurrentSession(pub SessionId);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Self(SessionId::new(value)))
            .ok_or_else(|| ApiError::unauthorized(format!("missing {SESSION_HEADER} header")))
    }
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: SessionId,
}

#[derive(Debug, Deserialize)]
struct PostMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: String,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/session", post(register_session))
        .route("/channels/{channel}", get(get_channel))
        .route("/channels/{channel}/users/{name}", post(join_channel))
        .route("/channels/{channel}/leave", post(leave_channel))
        .route("/channels/{channel}/messages", post(post_message))
        .route("/ws", get(websocket_upgrade))
}

/// `*` 允许任意来源，否则只允许列出的来源
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "忽略无效的 CORS 来源");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<SessionResponse>) {
    let session_id = state.chat_service.register_session();
    (StatusCode::CREATED, Json(SessionResponse { session_id }))
}

async fn get_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<Channel>, ApiError> {
    let channel = state.chat_service.channel(&channel).await?;
    Ok(Json(channel))
}

async fn join_channel(
    State(state): State<AppState>,
    CurrentSession(session_id): CurrentSession,
    Path((channel, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state
        .chat_service
        .join(&session_id, &name, &channel)
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

async fn leave_channel(
    State(state): State<AppState>,
    CurrentSession(session_id): CurrentSession,
    Path(channel): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .chat_service
        .leave(&session_id, Some(channel.as_str()))
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn post_message(
    State(state): State<AppState>,
    CurrentSession(session_id): CurrentSession,
    Path(channel): Path<String>,
    Json(payload): Json<PostMessagePayload>,
) -> Result<(StatusCode, Json<UserMessage>), ApiError> {
    let message = state
        .chat_service
        .post_message(&session_id, &channel, &payload.content)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session_id = query.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::bad_request("session_id must not be empty"));
    }
    let session_id = SessionId::new(session_id);

    Ok(ws.on_upgrade(move |socket| {
        WebSocketConnection::new(socket, state.chat_service.clone(), session_id).run()
    }))
}
