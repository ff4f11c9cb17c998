// ============================
// chathub-backend-lib/src/ws_router.rs
// ============================
//! HTTP surface: the WebSocket endpoint plus the chat REST routes.
use crate::auth::{extract_credential, AuthUser};
use crate::config::CorsSettings;
use crate::error::AppError;
use crate::metrics::{WS_AUTH_REJECTED, WS_CONNECTION};
use crate::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, RawQuery, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chathub_common::{ChatMessage, ConnectionStatus, ConversationSummary};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Close code sent when the credential on an upgrade request is rejected
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 100;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let chat = Router::new()
        .route("/ws-status", get(ws_status))
        .route("/unread", get(unread_count))
        .route("/read/{user_id}", put(mark_read))
        .route("/messages", get(messages))
        .route("/conversations", get(conversations));

    let api = Router::new()
        .route("/health", get(health))
        .nest("/chat", chat);

    Router::new()
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api)
        .fallback(not_found)
        .layer(cors_layer(&state.settings.cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credentialed CORS for the configured browser origins
fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            },
        })
        .collect();
    tracing::debug!(origins = ?origins, "CORS origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Authenticate, then upgrade and hand the socket to the connection pump.
///
/// A request without any credential is refused with 401 before upgrading.
/// A request whose credential does not verify is upgraded and closed with
/// [`CLOSE_UNAUTHORIZED`].
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(credential) = extract_credential(&headers, query.as_deref()) else {
        counter!(WS_AUTH_REJECTED, "reason" => "missing").increment(1);
        return AppError::Auth("missing credential".to_string()).into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let frame_limit = state.settings.hub.max_frame_size;
    let ws = ws.max_message_size(frame_limit).max_frame_size(frame_limit);

    match state.auth.authenticate(&credential).await {
        Ok(user_id) => {
            counter!(WS_CONNECTION).increment(1);
            ws.on_upgrade(move |socket| async move {
                let (sink, source) = socket.split();
                state.track_connection(user_id, sink, source).await;
            })
        },
        Err(e) => {
            counter!(WS_AUTH_REJECTED, "reason" => "invalid").increment(1);
            tracing::info!(error = %e, "websocket credential rejected");
            ws.on_upgrade(reject_socket)
        },
    }
}

async fn reject_socket(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "unauthorized".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
    let _ = socket.close().await;
}

async fn ws_status(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
) -> Result<Json<ConnectionStatus>, AppError> {
    Ok(Json(state.hub.status().await?))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let count = with_store_timeout(&state, "unread_count", state.messages.unread_count(&user_id)).await?;
    Ok(Json(json!({ "unread_count": count })))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(other_user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = with_store_timeout(
        &state,
        "mark_read",
        state.messages.mark_read(&user_id, &other_user_id),
    )
    .await?;
    tracing::info!(
        reader = %user_id,
        sender = %other_user_id,
        updated,
        "messages marked as read"
    );
    Ok(Json(json!({
        "message": "Messages marked as read",
        "messages_updated": updated,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessagesQuery {
    pub user_id: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesPage {
    pub messages: Vec<ChatMessage>,
    pub pagination: Pagination,
}

/// One page of the conversation with another user, newest page first.
/// Unread messages from the other user are marked read in the background.
async fn messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesPage>, AppError> {
    let other_user_id = query
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::InvalidInput("user_id parameter is required".to_string()))?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);

    let conversation = with_store_timeout(
        &state,
        "conversation",
        state.messages.conversation(&user_id, &other_user_id),
    )
    .await?;

    let mut messages: Vec<ChatMessage> = conversation
        .into_iter()
        .rev()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();
    messages.reverse();

    let store = Arc::clone(&state.messages);
    let deadline = state.settings.hub.store_timeout();
    let reader = user_id.clone();
    let sender = other_user_id.clone();
    tokio::spawn(async move {
        match tokio::time::timeout(deadline, store.mark_read(&reader, &sender)).await {
            Ok(Ok(updated)) => tracing::debug!(reader = %reader, sender = %sender, updated, "marked read"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to mark messages as read"),
            Err(_) => tracing::warn!(timeout = ?deadline, "marking messages as read timed out"),
        }
    });

    let total = messages.len();
    Ok(Json(MessagesPage {
        messages,
        pagination: Pagination { page, limit, total },
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
    pub total: usize,
}

/// Every peer the caller has talked to, with the latest message and unread count
async fn conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ConversationList>, AppError> {
    let conversations =
        with_store_timeout(&state, "conversations", state.messages.conversations(&user_id)).await?;
    let total = conversations.len();
    Ok(Json(ConversationList { conversations, total }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().timestamp(),
    }))
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route not found" })))
}

async fn with_store_timeout<T, F>(state: &AppState, op: &'static str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(state.settings.hub.store_timeout(), fut)
        .await
        .map_err(|_| AppError::StorageTimeout(op))?
}
