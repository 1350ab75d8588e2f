//! HTTP request handlers for the notification API.
//!
//! All handlers follow the contract:
//! - The caller is identified by `X-User-Id`, nothing more
//! - Notification reads never fail because the schema is missing
//! - Message bodies are logged at debug level only

use crate::auth::{AuthError, CurrentUser, IngestAuth};
use crate::background::BackgroundPoller;
use crate::classify::extract_fields;
use crate::config::Config;
use crate::ingest::IngestionService;
use crate::models::*;
use crate::poller::ErrorSlot;
use crate::read_state::{ReadState, ReadStateError};
use crate::router::SessionRouter;
use crate::sessions::{SessionError, Sessions};
use crate::store::{Store, StoreError, StoreMetrics};
use crate::upstream::{UpstreamClient, UpstreamError};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::Utc;
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broadcast channel capacity for SSE events
const BROADCAST_CAPACITY: usize = 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub ingest: IngestionService,
    pub sessions: Sessions,
    pub read_state: ReadState,
    pub ingest_auth: IngestAuth,
    /// Upstream source for the proxy routes (absent when not configured)
    pub upstream: Option<UpstreamClient>,
    pub background: Option<Arc<BackgroundPoller>>,
    pub poll_errors: ErrorSlot,
    pub notification_window_hours: u32,
    pub cancellation_window_hours: u32,
    /// Broadcast channel for SSE events
    pub broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

impl AppState {
    pub fn new(store: Arc<Store>, config: &Config) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let ingest = IngestionService::new(
            store.clone(),
            SessionRouter::new(store.clone()),
            broadcast_tx.clone(),
        );
        Self {
            sessions: Sessions::new(store.clone()),
            read_state: ReadState::new(store.clone()),
            store,
            ingest,
            ingest_auth: IngestAuth::new(config.ingest_api_key.as_deref()),
            upstream: None,
            background: None,
            poll_errors: ErrorSlot::new(),
            notification_window_hours: config.notification_window_hours,
            cancellation_window_hours: config.cancellation_window_hours,
            broadcast_tx,
        }
    }

    pub fn with_upstream(mut self, upstream: UpstreamClient) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_background(mut self, background: Arc<BackgroundPoller>) -> Self {
        self.background = Some(background);
        self
    }
}

// === Health Check ===

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        schema_ready: state.store.is_schema_ready(),
        last_poll_error: state
            .poll_errors
            .current()
            .map(|f| format!("{}: {}", f.stream, f.message)),
    })
}

/// GET /api/metrics - Aggregate ingestion counters
pub async fn metrics(State(state): State<AppState>) -> Json<StoreMetrics> {
    Json(state.store.get_metrics().await)
}

// === Upstream Proxy ===

/// GET /api/proxy/messages/recent - Recent cabinet messages from upstream
pub async fn proxy_recent_messages(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<MessageBatch>, ApiError> {
    let hours = query.hours.unwrap_or(state.notification_window_hours);
    proxy_recent(&state, StreamKind::Notifications, hours).await
}

/// GET /api/proxy/cancellations/recent - Recent cancellations from upstream
pub async fn proxy_recent_cancellations(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<MessageBatch>, ApiError> {
    let hours = query.hours.unwrap_or(state.cancellation_window_hours);
    proxy_recent(&state, StreamKind::Cancellations, hours).await
}

async fn proxy_recent(
    state: &AppState,
    stream: StreamKind,
    hours: u32,
) -> Result<Json<MessageBatch>, ApiError> {
    let upstream = state.upstream.as_ref().ok_or(ApiError::UpstreamUnavailable)?;
    let mut messages = upstream.fetch_recent(stream, hours.max(1)).await?;
    messages.iter_mut().for_each(extract_fields);
    Ok(Json(MessageBatch { messages }))
}

// === Ingestion ===

/// POST /api/notifications/save - Ingest a notification batch
pub async fn save_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<MessageBatch>,
) -> Result<Json<SaveMessagesResponse>, ApiError> {
    save_batch(&state, &headers, batch, StreamKind::Notifications).await
}

/// POST /api/notifications/save-cancellations - Ingest a cancellation batch
pub async fn save_cancellations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<MessageBatch>,
) -> Result<Json<SaveMessagesResponse>, ApiError> {
    save_batch(&state, &headers, batch, StreamKind::Cancellations).await
}

async fn save_batch(
    state: &AppState,
    headers: &HeaderMap,
    batch: MessageBatch,
    stream: StreamKind,
) -> Result<Json<SaveMessagesResponse>, ApiError> {
    if let Err(e) = state.ingest_auth.verify(headers) {
        warn!(stream = %stream, "Rejected batch with bad ingest key");
        return Err(e.into());
    }

    debug!(stream = %stream, count = batch.messages.len(), "Batch received");
    let results = state.ingest.ingest(batch.messages, stream).await;
    Ok(Json(SaveMessagesResponse { results }))
}

// === Schema ===

/// POST /api/admin/schema - Provision the notification schema
///
/// Guarded by the ingest key. Background pollers are woken afterwards so the
/// window missed while initializing is fetched again.
pub async fn provision_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SchemaResponse>, ApiError> {
    state.ingest_auth.verify(&headers)?;

    let provisioned = state.store.migrate();
    if provisioned {
        if let Some(background) = &state.background {
            background.wake();
        }
    }
    Ok(Json(SchemaResponse {
        schema_ready: true,
        provisioned,
    }))
}

// === Notifications ===

/// GET /api/notifications/unread
pub async fn unread_notifications(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Json<Vec<Notification>> {
    Json(state.read_state.unread_list(user_id))
}

/// GET /api/notifications - Newest-first page of the caller's notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<NotificationPage>, ApiError> {
    let page = state
        .read_state
        .all_notifications(user_id, query.limit, query.cursor.as_deref())?;
    Ok(Json(page))
}

/// GET /api/notifications/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.read_state.unread_count(user_id),
    })
}

/// POST /api/notifications/:id/read
pub async fn mark_notification_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<AlertId>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.read_state.mark_as_read(user_id, id)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/notifications/read-all
pub async fn mark_all_notifications_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Json<SuccessResponse> {
    let changed = state.read_state.mark_all_as_read(user_id);
    debug!(user_id, changed, "Marked all notifications read");
    Json(SuccessResponse { success: true })
}

// === Cancellations ===

/// GET /api/cancellations/unread
pub async fn unread_cancellations(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<Vec<Cancellation>> {
    Json(state.read_state.unread_cancellations())
}

/// GET /api/cancellations/unread-count
pub async fn unread_cancellations_count(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<CountResponse> {
    Json(CountResponse {
        count: state.read_state.unread_cancellations_count(),
    })
}

/// POST /api/cancellations/:id/read
pub async fn mark_cancellation_read(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<AlertId>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.read_state.mark_cancellation_as_read(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/cancellations/read-all
pub async fn mark_all_cancellations_read(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<SuccessResponse> {
    state.read_state.mark_all_cancellations_as_read();
    Json(SuccessResponse { success: true })
}

// === Work Sessions ===

/// POST /api/sessions/start
pub async fn start_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<StartWorkRequest>,
) -> Result<(StatusCode, Json<WorkSession>), ApiError> {
    let session = state.sessions.start_work(user_id, req, Utc::now())?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions/active
pub async fn active_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Option<WorkSession>>, ApiError> {
    Ok(Json(state.sessions.active_session(user_id)?))
}

/// POST /api/sessions/:id/cabinets
pub async fn link_cabinet(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(link): Json<CabinetLink>,
) -> Result<Json<WorkSession>, ApiError> {
    Ok(Json(state.sessions.add_cabinet(user_id, session_id, &link)?))
}

/// DELETE /api/sessions/:id/cabinets
pub async fn unlink_cabinet(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<Uuid>,
    Json(req): Json<UnlinkCabinetRequest>,
) -> Result<Json<WorkSession>, ApiError> {
    Ok(Json(state.sessions.remove_cabinet(
        user_id,
        session_id,
        &req.idex_id,
    )?))
}

/// POST /api/sessions/:id/end
pub async fn end_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<WorkSession>, ApiError> {
    Ok(Json(state.sessions.end_work(user_id, session_id, Utc::now())?))
}

// === Polling ===

/// POST /api/poll/wake - Trigger an immediate background poll
pub async fn wake_pollers(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    let background = state.background.as_ref().ok_or(ApiError::UpstreamUnavailable)?;
    background.wake();
    Ok(StatusCode::ACCEPTED)
}

// === SSE Notification Stream ===

/// GET /api/notifications/stream - Server-Sent Events for new alerts
///
/// Delivers the caller's routed notifications and every cancellation.
pub async fn notification_stream(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(user_id, "SSE client connected");

    let rx = state.broadcast_tx.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if event.recipient.map_or(true, |r| r == user_id) => {
            match serde_json::to_string(&event.event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(_) => None,
            }
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

// === Error Handling ===

/// API error types
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(&'static str),
    NotFound(&'static str),
    Forbidden,
    /// User already has an open work session
    SessionActive,
    /// Schema not provisioned (session writes only; reads degrade)
    Initializing,
    UpstreamUnavailable,
    UpstreamTimeout,
    Upstream,
    Internal,
    /// Authorization error (wraps AuthError)
    Auth(AuthError),
}

/// Implement From<AuthError> to enable ? operator in handlers
impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<ReadStateError> for ApiError {
    fn from(err: ReadStateError) -> Self {
        match err {
            ReadStateError::Forbidden(_) => ApiError::Forbidden,
            ReadStateError::NotFound(_) => ApiError::NotFound("item not found"),
            ReadStateError::InvalidCursor => ApiError::InvalidInput("malformed cursor"),
            ReadStateError::Store(e) => {
                warn!(error = %e, "Read-state update failed");
                ApiError::Internal
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyActive(_) => ApiError::SessionActive,
            SessionError::NotFound(_) => ApiError::NotFound("session not found"),
            SessionError::NotOwner => ApiError::Forbidden,
            SessionError::InvalidCabinet => ApiError::InvalidInput("cabinet id must not be empty"),
            SessionError::Store(StoreError::SchemaNotReady) => ApiError::Initializing,
            SessionError::Store(e) => {
                warn!(error = %e, "Session update failed");
                ApiError::Internal
            }
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        warn!(error = %err, "Upstream proxy request failed");
        match err {
            UpstreamError::Timeout => ApiError::UpstreamTimeout,
            _ => ApiError::Upstream,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            ApiError::Auth(auth_err) => return auth_err.into_response(),
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "item belongs to another user",
            ),
            ApiError::SessionActive => (
                StatusCode::CONFLICT,
                "SESSION_ACTIVE",
                "user already has an active work session",
            ),
            ApiError::Initializing => (
                StatusCode::SERVICE_UNAVAILABLE,
                "INITIALIZING",
                "notification system is initializing",
            ),
            ApiError::UpstreamUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UPSTREAM_NOT_CONFIGURED",
                "upstream message source is not configured",
            ),
            ApiError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "UPSTREAM_TIMEOUT",
                "upstream message source timed out",
            ),
            ApiError::Upstream => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                "upstream message source failed",
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal server error",
            ),
        };

        let body = Json(ErrorResponse {
            error: message.to_string(),
            code,
        });

        (status, body).into_response()
    }
}
