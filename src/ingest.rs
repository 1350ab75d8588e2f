//! Ingestion and deduplication of upstream message batches.
//!
//! Every item is processed in isolation: a malformed message, an unknown
//! cabinet or an unprovisioned schema produces a per-item result and never
//! aborts the rest of the batch.

use crate::classify::{classify, display_text, extract_fields, Classified};
use crate::ids::{bound_chat_id, derive_id};
use crate::models::*;
use crate::router::SessionRouter;
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Reason reported for items dropped while the schema is missing
pub const REASON_INITIALIZING: &str = "initializing";

/// Where a poller hands its batches. Implemented in-process by
/// [`IngestionService`] and remotely by the save-endpoint client.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit(
        &self,
        stream: StreamKind,
        batch: Vec<RawMessage>,
    ) -> Result<Vec<IngestResult>, SinkError>;
}

/// Failure to hand a batch over as a whole
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("save request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("save endpoint returned status {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct IngestionService {
    store: Arc<Store>,
    router: SessionRouter,
    events: broadcast::Sender<BroadcastEvent>,
}

impl IngestionService {
    pub fn new(
        store: Arc<Store>,
        router: SessionRouter,
        events: broadcast::Sender<BroadcastEvent>,
    ) -> Self {
        Self {
            store,
            router,
            events,
        }
    }

    /// Persist a batch, one result per input message (same order).
    pub async fn ingest(&self, batch: Vec<RawMessage>, stream: StreamKind) -> Vec<IngestResult> {
        let now = Utc::now();
        let mut results = Vec::with_capacity(batch.len());

        for mut raw in batch {
            extract_fields(&mut raw);
            results.push(self.ingest_one(&raw, stream, now).await);
        }

        let saved = results
            .iter()
            .filter(|r| matches!(r.status, IngestStatus::Saved | IngestStatus::SavedWithUsers))
            .count();
        let not_saved = results
            .iter()
            .filter(|r| r.status == IngestStatus::NotSaved)
            .count();
        info!(
            stream = %stream,
            total = results.len(),
            saved,
            not_saved,
            "Ingested batch"
        );

        results
    }

    async fn ingest_one(
        &self,
        raw: &RawMessage,
        stream: StreamKind,
        now: DateTime<Utc>,
    ) -> IngestResult {
        let mut result = IngestResult {
            message_id: raw.message_id.clone(),
            id: None,
            kind: None,
            status: IngestStatus::Error,
            user_ids: Vec::new(),
            reason: None,
            error: None,
        };

        if let Err(reason) = validate(raw) {
            debug!(message_id = ?raw.message_id, reason, "Rejected malformed message");
            result.error = Some(reason.to_string());
            return result;
        }

        let classified = classify(raw, stream);
        let id = derive_id(raw);
        result.id = Some(id);
        result.kind = Some(classified.kind());

        match self.persist(classified, id, now).await {
            Ok(user_ids) if user_ids.is_empty() => result.status = IngestStatus::Saved,
            Ok(user_ids) => {
                result.status = IngestStatus::SavedWithUsers;
                result.user_ids = user_ids;
            }
            Err(StoreError::Duplicate(_)) => result.status = IngestStatus::Duplicate,
            Err(StoreError::SchemaNotReady) => {
                result.status = IngestStatus::NotSaved;
                result.reason = Some(REASON_INITIALIZING.to_string());
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to ingest message");
                result.error = Some(e.to_string());
            }
        }

        result
    }

    /// Store one classified message; returns the users it was routed to.
    async fn persist(
        &self,
        classified: Classified<'_>,
        id: AlertId,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>, StoreError> {
        if self.store.contains(id)? {
            self.store.record_duplicate().await;
            return Err(StoreError::Duplicate(id));
        }

        let (raw, is_cancellation) = match classified {
            Classified::Notification(raw) => (raw, false),
            Classified::Cancellation(raw) => (raw, true),
        };
        let internal_cabinet_id = self
            .store
            .resolve_cabinet(raw.cabinet_id.trim())?
            .map(|c| c.id);

        if is_cancellation {
            let cancellation = build_cancellation(raw, id, internal_cabinet_id, now);
            self.store.insert_cancellation(cancellation.clone()).await?;
            let _ = self.events.send(BroadcastEvent {
                recipient: None,
                event: StreamEvent::Cancellation(cancellation),
            });
            return Ok(Vec::new());
        }

        let notification = build_notification(raw, id, internal_cabinet_id, now);
        self.store.insert_notification(notification.clone()).await?;

        let copies = self.router.route(&notification).await?;
        let mut user_ids = Vec::with_capacity(copies.len());
        for copy in copies {
            if let Some(user_id) = copy.user_id {
                user_ids.push(user_id);
                let _ = self.events.send(BroadcastEvent {
                    recipient: Some(user_id),
                    event: StreamEvent::Notification(copy),
                });
            }
        }
        Ok(user_ids)
    }
}

#[async_trait]
impl BatchSink for IngestionService {
    async fn submit(
        &self,
        stream: StreamKind,
        batch: Vec<RawMessage>,
    ) -> Result<Vec<IngestResult>, SinkError> {
        Ok(self.ingest(batch, stream).await)
    }
}

fn validate(raw: &RawMessage) -> Result<(), &'static str> {
    if raw.message.trim().is_empty() {
        return Err("message text is empty");
    }
    if raw.timestamp_seconds < 0 || raw.timestamp_seconds.checked_mul(1000).is_none() {
        return Err("timestamp out of range");
    }
    if let Some(MessageId::Text(text)) = &raw.message_id {
        if text.trim().is_empty() {
            return Err("message id is blank");
        }
    }
    Ok(())
}

fn build_notification(
    raw: &RawMessage,
    id: AlertId,
    internal_cabinet_id: Option<i64>,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        id,
        chat_id: bound_chat_id(raw.chat_id),
        chat_name: raw.chat_name.clone(),
        cabinet_name: raw.cabinet_name.clone(),
        cabinet_id: raw.cabinet_id.trim().to_string(),
        message: raw.message.clone(),
        display_message: display_text(&raw.message),
        timestamp: raw.timestamp_seconds * 1000,
        is_read: false,
        user_id: None,
        internal_cabinet_id,
        created_at: now,
    }
}

fn build_cancellation(
    raw: &RawMessage,
    id: AlertId,
    internal_cabinet_id: Option<i64>,
    now: DateTime<Utc>,
) -> Cancellation {
    Cancellation {
        id,
        chat_id: bound_chat_id(raw.chat_id),
        chat_name: raw.chat_name.clone(),
        cabinet_name: raw.cabinet_name.clone(),
        cabinet_id: raw.cabinet_id.trim().to_string(),
        message: raw.message.clone(),
        display_message: display_text(&raw.message),
        timestamp: raw.timestamp_seconds * 1000,
        is_read: false,
        internal_cabinet_id,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sessions::Sessions;

    struct Harness {
        store: Arc<Store>,
        sessions: Sessions,
        ingest: IngestionService,
        events: broadcast::Receiver<BroadcastEvent>,
    }

    fn harness_with(config: &Config) -> Harness {
        let store = Arc::new(Store::new(config));
        let (tx, rx) = broadcast::channel(64);
        Harness {
            sessions: Sessions::new(store.clone()),
            ingest: IngestionService::new(store.clone(), SessionRouter::new(store.clone()), tx),
            store,
            events: rx,
        }
    }

    fn harness() -> Harness {
        harness_with(&Config::default())
    }

    fn raw(id: &str, cabinet: &str, text: &str) -> RawMessage {
        RawMessage {
            chat_id: 100,
            chat_name: "alerts".into(),
            cabinet_name: "X".into(),
            cabinet_id: cabinet.into(),
            message: text.into(),
            timestamp_seconds: 1_700_000_000,
            message_id: Some(MessageId::Text(id.into())),
        }
    }

    fn watch(h: &Harness, user: UserId, cabinets: &[&str]) -> WorkSession {
        let req = StartWorkRequest {
            comment: None,
            cabinets: cabinets
                .iter()
                .map(|c| CabinetLink {
                    idex_id: (*c).to_string(),
                    login: String::new(),
                })
                .collect(),
        };
        h.sessions.start_work(user, req, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn reingesting_batch_creates_no_duplicates() {
        let h = harness();
        let batch = vec![raw("1", "42", "first"), raw("2", "42", "second")];

        let first = h.ingest.ingest(batch.clone(), StreamKind::Notifications).await;
        assert!(first.iter().all(|r| r.status == IngestStatus::Saved));

        let second = h.ingest.ingest(batch, StreamKind::Notifications).await;
        assert!(second.iter().all(|r| r.status == IngestStatus::Duplicate));

        for (before, after) in first.iter().zip(&second) {
            assert_eq!(before.id, after.id);
            let id = before.id.unwrap();
            assert_eq!(h.store.notification_rows(id).unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn same_message_number_in_two_chats_is_kept_twice() {
        let h = harness();
        let mut from_a = raw("1", "42", "alert from chat A");
        from_a.message_id = Some(MessageId::Number(1));
        let mut from_b = raw("1", "42", "different alert from chat B");
        from_b.message_id = Some(MessageId::Number(1));
        from_b.chat_id = 200;

        let results = h
            .ingest
            .ingest(vec![from_a, from_b], StreamKind::Notifications)
            .await;

        assert_eq!(results[0].status, IngestStatus::Saved);
        assert_eq!(results[1].status, IngestStatus::Saved);
        assert_ne!(results[0].id, results[1].id);
        let texts: Vec<String> = results
            .iter()
            .map(|r| h.store.notification_rows(r.id.unwrap()).unwrap()[0].message.clone())
            .collect();
        assert_eq!(texts, ["alert from chat A", "different alert from chat B"]);
    }

    #[tokio::test]
    async fn same_message_number_on_both_streams_in_two_chats() {
        let h = harness();
        let notification = raw("3", "42", "hello");
        let mut cancellation = raw("3", "42", "Заявку невозможно обработать");
        cancellation.chat_id = 300;

        let n = h
            .ingest
            .ingest(vec![notification], StreamKind::Notifications)
            .await;
        let c = h
            .ingest
            .ingest(vec![cancellation], StreamKind::Cancellations)
            .await;

        assert_eq!(n[0].status, IngestStatus::Saved);
        assert_eq!(c[0].status, IngestStatus::Saved);
        assert_eq!(h.store.cancellations().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_collapse() {
        let h = harness();
        let batch = vec![raw("9", "42", "same"), raw("9", "42", "same")];
        let results = h.ingest.ingest(batch, StreamKind::Notifications).await;

        assert_eq!(results[0].status, IngestStatus::Saved);
        assert_eq!(results[1].status, IngestStatus::Duplicate);
    }

    #[tokio::test]
    async fn routes_to_single_active_session() {
        let h = harness();
        watch(&h, 7, &["42"]);

        let results = h
            .ingest
            .ingest(
                vec![raw("555", "42", "[X#42] Автоматическое оповещение:알림")],
                StreamKind::Notifications,
            )
            .await;

        assert_eq!(results[0].status, IngestStatus::SavedWithUsers);
        assert_eq!(results[0].user_ids, vec![7]);

        let rows = h.store.notification_rows(results[0].id.unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        let n = &rows[0];
        assert_eq!(n.user_id, Some(7));
        assert_eq!(n.cabinet_id, "42");
        assert_eq!(n.display_message, "[X#42] 알림");
        assert_eq!(n.timestamp, 1_700_000_000_000);
        assert!(!n.is_read);
    }

    #[tokio::test]
    async fn unwatched_cabinet_stays_unrouted() {
        let h = harness();
        watch(&h, 7, &["43"]);

        let results = h
            .ingest
            .ingest(vec![raw("1", "42", "hello")], StreamKind::Notifications)
            .await;

        assert_eq!(results[0].status, IngestStatus::Saved);
        let rows = h.store.notification_rows(results[0].id.unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, None);
    }

    #[tokio::test]
    async fn two_sessions_get_independent_copies() {
        let h = harness();
        watch(&h, 7, &["42"]);
        watch(&h, 8, &["42", "50"]);

        let results = h
            .ingest
            .ingest(vec![raw("1", "42", "hello")], StreamKind::Notifications)
            .await;
        assert_eq!(results[0].user_ids, vec![7, 8]);

        let id = results[0].id.unwrap();
        let rows = h.store.notification_rows(id).unwrap();
        assert_eq!(rows.len(), 2);

        h.store.mark_notification_read(7, id).unwrap();
        let rows = h.store.notification_rows(id).unwrap();
        let of = |user| rows.iter().find(|r| r.user_id == Some(user)).unwrap();
        assert!(of(7).is_read);
        assert!(!of(8).is_read);
    }

    #[tokio::test]
    async fn closed_session_receives_nothing() {
        let h = harness();
        let session = watch(&h, 7, &["42"]);
        h.sessions.end_work(7, session.id, Utc::now()).unwrap();

        let results = h
            .ingest
            .ingest(vec![raw("1", "42", "late")], StreamKind::Notifications)
            .await;

        assert_eq!(results[0].status, IngestStatus::Saved);
        let id = results[0].id.unwrap();
        assert_eq!(h.store.notification_rows(id).unwrap()[0].user_id, None);
    }

    #[tokio::test]
    async fn cancellation_marker_bypasses_router() {
        let h = harness();
        watch(&h, 7, &["42"]);

        let results = h
            .ingest
            .ingest(
                vec![raw("77", "42", "Заявку невозможно обработать")],
                StreamKind::Notifications,
            )
            .await;

        assert_eq!(results[0].kind, Some(AlertKind::Cancellation));
        assert_eq!(results[0].status, IngestStatus::Saved);
        assert!(results[0].user_ids.is_empty());
        let id = results[0].id.unwrap();
        assert!(h.store.notification_rows(id).unwrap().is_empty());
        assert_eq!(h.store.cancellations().unwrap()[0].id, id);

        // Seen again on the cancellation stream
        let again = h
            .ingest
            .ingest(
                vec![raw("77", "42", "Заявку невозможно обработать")],
                StreamKind::Cancellations,
            )
            .await;
        assert_eq!(again[0].status, IngestStatus::Duplicate);
    }

    #[tokio::test]
    async fn schema_not_ready_reports_soft_failure() {
        let mut config = Config::default();
        config.schema_ready = false;
        let h = harness_with(&config);

        let results = h
            .ingest
            .ingest(
                vec![raw("1", "42", "a"), raw("2", "42", "b")],
                StreamKind::Notifications,
            )
            .await;

        assert!(results.iter().all(|r| r.status == IngestStatus::NotSaved));
        assert!(results
            .iter()
            .all(|r| r.reason.as_deref() == Some(REASON_INITIALIZING)));
    }

    #[tokio::test]
    async fn malformed_item_does_not_abort_batch() {
        let h = harness();
        let results = h
            .ingest
            .ingest(
                vec![raw("1", "42", "   "), raw("2", "42", "fine")],
                StreamKind::Notifications,
            )
            .await;

        assert_eq!(results[0].status, IngestStatus::Error);
        assert!(results[0].error.is_some());
        assert_eq!(results[1].status, IngestStatus::Saved);
    }

    #[tokio::test]
    async fn resolves_known_cabinet_and_extracts_header() {
        let h = harness();
        let cabinet = h.store.upsert_cabinet("42", "main").unwrap();

        let mut message = raw("5", "", "[X#42] Автоматическое оповещение: hi");
        message.cabinet_name = String::new();
        let results = h
            .ingest
            .ingest(vec![message], StreamKind::Notifications)
            .await;

        let row = &h.store.notification_rows(results[0].id.unwrap()).unwrap()[0];
        assert_eq!(row.cabinet_id, "42");
        assert_eq!(row.cabinet_name, "X");
        assert_eq!(row.internal_cabinet_id, Some(cabinet.id));
    }

    #[tokio::test]
    async fn routed_copies_are_broadcast() {
        let mut h = harness();
        watch(&h, 7, &["42"]);

        let results = h
            .ingest
            .ingest(vec![raw("1", "42", "hello")], StreamKind::Notifications)
            .await;
        let id = results[0].id.unwrap();

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.recipient, Some(7));
        assert!(matches!(event.event, StreamEvent::Notification(n) if n.id == id));
    }
}
