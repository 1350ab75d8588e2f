//! Data models for the notification relay.
//!
//! Upstream payloads are accepted leniently (every field defaults) so that a
//! single malformed item is rejected during ingestion instead of failing the
//! whole batch at deserialization time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Dashboard user identifier
pub type UserId = i64;

/// Stable 64-bit notification/cancellation identifier
pub type AlertId = i64;

/// Upper bound of the internal chat id range
pub const MAX_CHAT_ID: i64 = 2_147_483_647;

// ============================================================================
// Upstream payloads
// ============================================================================

/// Upstream message id: chat platforms send either integers or strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::Text(s) => f.write_str(s),
        }
    }
}

/// Message as returned by the upstream source (transient, never stored as-is)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    pub chat_id: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub chat_name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub cabinet_name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub cabinet_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub message: String,
    #[serde(alias = "timestamp")]
    pub timestamp_seconds: i64,
    pub message_id: Option<MessageId>,
}

/// Accept `"42"`, `42` and `null` for string fields.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Text(s)) => s,
        Some(Loose::Int(n)) => n.to_string(),
        Some(Loose::Float(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Batch envelope used by the upstream source and the save endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBatch {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

/// The two independent poll streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Notifications,
    Cancellations,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Notifications => "notifications",
            StreamKind::Cancellations => "cancellations",
        })
    }
}

// ============================================================================
// Persisted records
// ============================================================================

/// User-routed alert derived from an upstream chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: AlertId,
    pub chat_id: i32,
    pub chat_name: String,
    pub cabinet_name: String,
    /// External cabinet identifier (denormalized)
    pub cabinet_id: String,
    /// Full upstream text, boilerplate included
    pub message: String,
    /// Text with the boilerplate prefix removed
    pub display_message: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub is_read: bool,
    /// Recipient; `None` until the router assigns one, never reassigned
    pub user_id: Option<UserId>,
    /// Resolved `IdexCabinet`, if known
    pub internal_cabinet_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Globally-scoped alert for a failed/cancelled operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub id: AlertId,
    pub chat_id: i32,
    pub chat_name: String,
    pub cabinet_name: String,
    pub cabinet_id: String,
    pub message: String,
    pub display_message: String,
    pub timestamp: i64,
    pub is_read: bool,
    pub internal_cabinet_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Internal mirror of an upstream cabinet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdexCabinet {
    pub id: i64,
    pub idex_id: String,
    pub login: String,
}

/// Time-bounded record of a user monitoring a set of cabinets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: Uuid,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end, set on close
    pub duration: Option<i64>,
    /// External cabinet ids (`idexId`)
    pub cabinets: BTreeSet<String>,
    pub comment: Option<String>,
}

impl WorkSession {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

// ============================================================================
// Ingestion results
// ============================================================================

/// Classification tag of a stored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Notification,
    Cancellation,
}

/// Per-item ingestion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Stored, no recipient (or a cancellation)
    Saved,
    /// Stored and routed to at least one user
    SavedWithUsers,
    /// Already stored by an earlier batch
    Duplicate,
    /// Backing schema not provisioned yet
    NotSaved,
    /// Unexpected or validation failure for this item only
    Error,
}

/// Result for one message of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub message_id: Option<MessageId>,
    pub id: Option<AlertId>,
    pub kind: Option<AlertKind>,
    pub status: IngestStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Save endpoint response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveMessagesResponse {
    pub results: Vec<IngestResult>,
}

// ============================================================================
// Pagination
// ============================================================================

/// Cursor for newest-first pagination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Timestamp (ms) of the last item on the previous page
    pub timestamp: i64,
    /// Id of the last item on the previous page (tie-break)
    pub id: AlertId,
}

impl Cursor {
    /// Encode cursor to base64 string
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, json)
    }

    /// Decode cursor from base64 string
    pub fn decode(s: &str) -> Option<Self> {
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, s).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Whether `(timestamp, id)` sorts strictly after this cursor (newest first)
    pub fn precedes(&self, timestamp: i64, id: AlertId) -> bool {
        (timestamp, id) < (self.timestamp, self.id)
    }
}

// === API Request/Response Models ===

/// Upstream / proxy window query
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub hours: Option<u32>,
}

/// `getAllNotifications` query
#[derive(Debug, Default, Deserialize)]
pub struct ListNotificationsQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// One page of notifications
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Cabinet reference supplied when linking a cabinet to a session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CabinetLink {
    pub idex_id: String,
    #[serde(default)]
    pub login: String,
}

/// Start work request
#[derive(Debug, Default, Deserialize)]
pub struct StartWorkRequest {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub cabinets: Vec<CabinetLink>,
}

/// Unlink cabinet request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlinkCabinetRequest {
    pub idex_id: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub schema_ready: bool,
    /// Most recent background poll failure, if not yet recovered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_error: Option<String>,
}

/// Schema provisioning response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub schema_ready: bool,
    /// False when the schema already existed
    pub provisioned: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

// === SSE Event Models ===

/// Event sent over SSE stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Notification(Notification),
    Cancellation(Cancellation),
}

/// Internal broadcast event (recipient + event); `None` reaches every listener
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub recipient: Option<UserId>,
    pub event: StreamEvent,
}
