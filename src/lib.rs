//! # Opsboard Notify
//!
//! Notification core of the operations dashboard: relays chat-platform
//! cabinet alerts and cancellations to the operators watching those cabinets.
//!
//! ## Design Principles
//!
//! - **Idempotent ingestion**: one stored row per upstream message, however
//!   often it is polled
//! - **Session routing**: notifications go to users whose open work session
//!   links the message's cabinet; cancellations are global
//! - **Redundant polling**: server wake-ups and client timers feed the same
//!   ingestion contract
//! - **Graceful degradation**: an unprovisioned schema yields empty reads and
//!   `not_saved` results, never errors
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌───────────┐   ┌────────┐   ┌──────────────┐
//! │ Upstream │──▶│ Poller │──▶│ Ingestion │──▶│ Router │──▶│ Store / SSE  │
//! └──────────┘   └────────┘   └───────────┘   └────────┘   └──────┬───────┘
//!                                                                 │
//!                                             ┌───────────────────┴──┐
//!                                             │ Delivery client      │
//!                                             │ (sound, desktop, UI) │
//!                                             └──────────────────────┘
//! ```
//!
//! ## API Overview
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Health check |
//! | `/api/metrics` | GET | Ingestion counters |
//! | `/api/proxy/messages/recent` | GET | Upstream messages |
//! | `/api/proxy/cancellations/recent` | GET | Upstream cancellations |
//! | `/api/notifications/save` | POST | Ingest notifications |
//! | `/api/notifications/save-cancellations` | POST | Ingest cancellations |
//! | `/api/admin/schema` | POST | Provision the schema (ingest key) |
//! | `/api/notifications` | GET | Paged notifications |
//! | `/api/notifications/unread` | GET | Unread notifications |
//! | `/api/notifications/unread-count` | GET | Unread count |
//! | `/api/notifications/:id/read` | POST | Mark read |
//! | `/api/notifications/read-all` | POST | Mark all read |
//! | `/api/notifications/stream` | GET | SSE real-time stream |
//! | `/api/cancellations/unread` | GET | Unread cancellations |
//! | `/api/cancellations/unread-count` | GET | Unread count |
//! | `/api/cancellations/:id/read` | POST | Mark read |
//! | `/api/cancellations/read-all` | POST | Mark all read |
//! | `/api/sessions/start` | POST | Start work |
//! | `/api/sessions/active` | GET | Open session |
//! | `/api/sessions/:id/cabinets` | POST/DELETE | Link/unlink cabinet |
//! | `/api/sessions/:id/end` | POST | End work |
//! | `/api/poll/wake` | POST | Wake background pollers |

pub mod alerts;
pub mod auth;
pub mod background;
pub mod classify;
pub mod config;
pub mod delivery;
pub mod handlers;
pub mod ids;
pub mod ingest;
pub mod models;
pub mod poller;
pub mod read_state;
pub mod router;
pub mod save_client;
pub mod sessions;
pub mod store;
pub mod upstream;

pub use config::Config;
pub use handlers::AppState;
pub use store::Store;

use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

/// Maximum request body size (1 MiB, room for large catch-up batches).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Build the Axum router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check (unauthenticated)
        .route("/health", get(handlers::health))
        .route("/api/metrics", get(handlers::metrics))
        // Upstream proxy
        .route("/api/proxy/messages/recent", get(handlers::proxy_recent_messages))
        .route(
            "/api/proxy/cancellations/recent",
            get(handlers::proxy_recent_cancellations),
        )
        // Ingestion
        .route("/api/notifications/save", post(handlers::save_notifications))
        .route(
            "/api/notifications/save-cancellations",
            post(handlers::save_cancellations),
        )
        .route("/api/admin/schema", post(handlers::provision_schema))
        // Notifications
        .route("/api/notifications", get(handlers::list_notifications))
        .route("/api/notifications/unread", get(handlers::unread_notifications))
        .route("/api/notifications/unread-count", get(handlers::unread_count))
        .route(
            "/api/notifications/read-all",
            post(handlers::mark_all_notifications_read),
        )
        .route(
            "/api/notifications/:id/read",
            post(handlers::mark_notification_read),
        )
        .route("/api/notifications/stream", get(handlers::notification_stream))
        // Cancellations
        .route("/api/cancellations/unread", get(handlers::unread_cancellations))
        .route(
            "/api/cancellations/unread-count",
            get(handlers::unread_cancellations_count),
        )
        .route(
            "/api/cancellations/read-all",
            post(handlers::mark_all_cancellations_read),
        )
        .route(
            "/api/cancellations/:id/read",
            post(handlers::mark_cancellation_read),
        )
        // Work sessions
        .route("/api/sessions/start", post(handlers::start_session))
        .route("/api/sessions/active", get(handlers::active_session))
        .route(
            "/api/sessions/:id/cabinets",
            post(handlers::link_cabinet).delete(handlers::unlink_cabinet),
        )
        .route("/api/sessions/:id/end", post(handlers::end_session))
        // Polling
        .route("/api/poll/wake", post(handlers::wake_pollers))
        // Middleware
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([Method::GET, Method::POST, Method::DELETE])
                    .allow_headers([
                        header::CONTENT_TYPE,
                        HeaderName::from_static(auth::USER_ID_HEADER),
                        HeaderName::from_static(auth::API_KEY_HEADER),
                    ]),
            ),
        )
        .with_state(state)
}
