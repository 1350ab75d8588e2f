//! In-memory notification store.
//!
//! Holds notifications (one row per recipient copy), cancellations, work
//! sessions and the cabinet registry. Until the schema is provisioned every
//! operation fails with [`StoreError::SchemaNotReady`], which callers turn into
//! soft results instead of hard errors.

use crate::config::Config;
use crate::models::*;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Thread-safe in-memory store
#[derive(Clone)]
pub struct Store {
    /// Notification rows keyed by message id; one entry per recipient copy
    notifications: Arc<DashMap<AlertId, Vec<Notification>>>,

    /// Cancellations keyed by message id
    cancellations: Arc<DashMap<AlertId, Cancellation>>,

    /// Work sessions by id
    sessions: Arc<DashMap<Uuid, WorkSession>>,

    /// Open session per user (enforces one active session per user)
    active_sessions: Arc<DashMap<UserId, Uuid>>,

    /// Cabinet registry keyed by external `idexId`
    cabinets: Arc<DashMap<String, IdexCabinet>>,

    next_cabinet_id: Arc<AtomicI64>,

    /// Whether the schema has been provisioned
    schema_ready: Arc<AtomicBool>,

    /// Metrics (aggregate only)
    metrics: Arc<RwLock<StoreMetrics>>,
}

/// Aggregate metrics
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreMetrics {
    pub total_notifications: u64,
    pub total_cancellations: u64,
    pub total_duplicates: u64,
    pub total_routed_copies: u64,
}

/// Outcome of an ownership-checked read mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    /// Rows exist but none belongs to the caller
    NotOwner,
    NotFound,
}

impl Store {
    /// Create a new empty store; provisioned unless the config says otherwise
    pub fn new(config: &Config) -> Self {
        let store = Self {
            notifications: Arc::new(DashMap::new()),
            cancellations: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            active_sessions: Arc::new(DashMap::new()),
            cabinets: Arc::new(DashMap::new()),
            next_cabinet_id: Arc::new(AtomicI64::new(1)),
            schema_ready: Arc::new(AtomicBool::new(config.schema_ready)),
            metrics: Arc::new(RwLock::new(StoreMetrics::default())),
        };
        if !config.schema_ready {
            info!("Store started without schema, notification subsystem initializing");
        }
        store
    }

    /// Provision the schema. Idempotent; returns whether this call created it.
    pub fn migrate(&self) -> bool {
        let created = !self.schema_ready.swap(true, Ordering::SeqCst);
        if created {
            info!("Notification schema provisioned");
        }
        created
    }

    pub fn is_schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.is_schema_ready() {
            Ok(())
        } else {
            Err(StoreError::SchemaNotReady)
        }
    }

    // === Ingestion ===

    /// Whether a message id has already been stored as either kind
    pub fn contains(&self, id: AlertId) -> Result<bool, StoreError> {
        self.ensure_schema()?;
        Ok(self.notifications.contains_key(&id) || self.cancellations.contains_key(&id))
    }

    /// Insert the base (unrouted) row of a notification.
    ///
    /// Fails with `Duplicate` if the id already exists as either kind.
    pub async fn insert_notification(&self, notification: Notification) -> Result<(), StoreError> {
        self.ensure_schema()?;
        let id = notification.id;

        if self.cancellations.contains_key(&id) {
            self.record_duplicate().await;
            return Err(StoreError::Duplicate(id));
        }
        let inserted = match self.notifications.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(vec![notification]);
                true
            }
        };
        if !inserted {
            self.record_duplicate().await;
            return Err(StoreError::Duplicate(id));
        }

        self.metrics.write().await.total_notifications += 1;
        debug!(id, "Stored notification");
        Ok(())
    }

    /// Insert a cancellation. Fails with `Duplicate` if the id exists.
    pub async fn insert_cancellation(&self, cancellation: Cancellation) -> Result<(), StoreError> {
        self.ensure_schema()?;
        let id = cancellation.id;

        if self.notifications.contains_key(&id) {
            self.record_duplicate().await;
            return Err(StoreError::Duplicate(id));
        }
        let inserted = match self.cancellations.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(cancellation);
                true
            }
        };
        if !inserted {
            self.record_duplicate().await;
            return Err(StoreError::Duplicate(id));
        }

        self.metrics.write().await.total_cancellations += 1;
        debug!(id, "Stored cancellation");
        Ok(())
    }

    /// Attach a recipient to a stored notification.
    ///
    /// The unrouted base row is claimed by the first recipient; later
    /// recipients get their own copy. A recipient that already has a copy gets
    /// that copy back unchanged. Assigned owners are never replaced.
    pub async fn assign_recipient(
        &self,
        id: AlertId,
        user_id: UserId,
    ) -> Result<Notification, StoreError> {
        self.ensure_schema()?;

        let copy = {
            let mut rows = self
                .notifications
                .get_mut(&id)
                .ok_or(StoreError::NotFound(id))?;

            if let Some(existing) = rows.iter().find(|n| n.user_id == Some(user_id)) {
                return Ok(existing.clone());
            }

            if let Some(base) = rows.iter_mut().find(|n| n.user_id.is_none()) {
                base.user_id = Some(user_id);
                base.clone()
            } else {
                let mut copy = rows[0].clone();
                copy.user_id = Some(user_id);
                copy.is_read = false;
                copy.created_at = Utc::now();
                rows.push(copy.clone());
                copy
            }
        };

        self.metrics.write().await.total_routed_copies += 1;
        Ok(copy)
    }

    /// Every row of a message id (all recipient copies)
    pub fn notification_rows(&self, id: AlertId) -> Result<Vec<Notification>, StoreError> {
        self.ensure_schema()?;
        Ok(self
            .notifications
            .get(&id)
            .map(|rows| rows.value().clone())
            .unwrap_or_default())
    }

    // === Read state ===

    /// Notifications owned by a user, newest first
    pub fn user_notifications(&self, user_id: UserId) -> Result<Vec<Notification>, StoreError> {
        self.ensure_schema()?;
        let mut rows: Vec<Notification> = self
            .notifications
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|n| n.user_id == Some(user_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        Ok(rows)
    }

    /// Mark the caller's copy of a notification as read
    pub fn mark_notification_read(
        &self,
        user_id: UserId,
        id: AlertId,
    ) -> Result<MarkOutcome, StoreError> {
        self.ensure_schema()?;
        let Some(mut rows) = self.notifications.get_mut(&id) else {
            return Ok(MarkOutcome::NotFound);
        };
        match rows.iter_mut().find(|n| n.user_id == Some(user_id)) {
            Some(row) => {
                row.is_read = true;
                Ok(MarkOutcome::Marked)
            }
            None => Ok(MarkOutcome::NotOwner),
        }
    }

    /// Mark every notification owned by a user as read; returns how many changed
    pub fn mark_all_notifications_read(&self, user_id: UserId) -> Result<usize, StoreError> {
        self.ensure_schema()?;
        let mut changed = 0;
        for mut entry in self.notifications.iter_mut() {
            for row in entry.value_mut().iter_mut() {
                if row.user_id == Some(user_id) && !row.is_read {
                    row.is_read = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// All cancellations, newest first
    pub fn cancellations(&self) -> Result<Vec<Cancellation>, StoreError> {
        self.ensure_schema()?;
        let mut rows: Vec<Cancellation> = self
            .cancellations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        Ok(rows)
    }

    /// Mark a cancellation as read; `false` if it does not exist
    pub fn mark_cancellation_read(&self, id: AlertId) -> Result<bool, StoreError> {
        self.ensure_schema()?;
        Ok(match self.cancellations.get_mut(&id) {
            Some(mut row) => {
                row.is_read = true;
                true
            }
            None => false,
        })
    }

    /// Mark every cancellation as read; returns how many changed
    pub fn mark_all_cancellations_read(&self) -> Result<usize, StoreError> {
        self.ensure_schema()?;
        let mut changed = 0;
        for mut entry in self.cancellations.iter_mut() {
            if !entry.is_read {
                entry.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    // === Cabinets ===

    /// Look up the internal cabinet for an external id
    pub fn resolve_cabinet(&self, idex_id: &str) -> Result<Option<IdexCabinet>, StoreError> {
        self.ensure_schema()?;
        Ok(self.cabinets.get(idex_id).map(|c| c.value().clone()))
    }

    /// Register a cabinet, or refresh its login if already known
    pub fn upsert_cabinet(&self, idex_id: &str, login: &str) -> Result<IdexCabinet, StoreError> {
        self.ensure_schema()?;
        let mut entry = self
            .cabinets
            .entry(idex_id.to_string())
            .or_insert_with(|| IdexCabinet {
                id: self.next_cabinet_id.fetch_add(1, Ordering::SeqCst),
                idex_id: idex_id.to_string(),
                login: login.to_string(),
            });
        if !login.is_empty() {
            entry.login = login.to_string();
        }
        Ok(entry.value().clone())
    }

    // === Work sessions ===

    /// Store a new open session; rejected if the user already has one
    pub fn open_session(&self, session: WorkSession) -> Result<(), StoreError> {
        self.ensure_schema()?;
        match self.active_sessions.entry(session.user_id) {
            Entry::Occupied(existing) => Err(StoreError::ActiveSessionExists(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(session.id);
                self.sessions.insert(session.id, session);
                Ok(())
            }
        }
    }

    pub fn session(&self, id: Uuid) -> Result<Option<WorkSession>, StoreError> {
        self.ensure_schema()?;
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    /// The user's open session, if any
    pub fn active_session(&self, user_id: UserId) -> Result<Option<WorkSession>, StoreError> {
        self.ensure_schema()?;
        let Some(id) = self.active_sessions.get(&user_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    /// Apply a change to a session's cabinet set
    pub fn update_session_cabinets<F>(&self, id: Uuid, f: F) -> Result<Option<WorkSession>, StoreError>
    where
        F: FnOnce(&mut std::collections::BTreeSet<String>),
    {
        self.ensure_schema()?;
        Ok(self.sessions.get_mut(&id).map(|mut session| {
            f(&mut session.cabinets);
            session.clone()
        }))
    }

    /// Close a session. Closing twice keeps the first end time.
    pub fn close_session(
        &self,
        id: Uuid,
        end_time: DateTime<Utc>,
    ) -> Result<Option<WorkSession>, StoreError> {
        self.ensure_schema()?;
        let closed = {
            let Some(mut session) = self.sessions.get_mut(&id) else {
                return Ok(None);
            };
            if session.end_time.is_none() {
                let end_time = end_time.max(session.start_time);
                session.end_time = Some(end_time);
                session.duration = Some((end_time - session.start_time).num_seconds());
            }
            session.clone()
        };
        // Lock order is active_sessions -> sessions everywhere else
        self.active_sessions
            .remove_if(&closed.user_id, |_, active| *active == id);
        Ok(Some(closed))
    }

    /// Open sessions whose cabinet set contains the external cabinet id
    pub fn active_sessions_with_cabinet(
        &self,
        idex_id: &str,
    ) -> Result<Vec<WorkSession>, StoreError> {
        self.ensure_schema()?;
        Ok(self
            .active_sessions
            .iter()
            .filter_map(|entry| self.sessions.get(entry.value()).map(|s| s.value().clone()))
            .filter(|s| s.is_active() && s.cabinets.contains(idex_id))
            .collect())
    }

    /// Count a duplicate submission turned away before reaching the store
    pub async fn record_duplicate(&self) {
        self.metrics.write().await.total_duplicates += 1;
    }

    /// Get aggregate metrics
    pub async fn get_metrics(&self) -> StoreMetrics {
        self.metrics.read().await.clone()
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("notification schema is not provisioned yet")]
    SchemaNotReady,

    #[error("item {0} already stored")]
    Duplicate(AlertId),

    #[error("item {0} not found")]
    NotFound(AlertId),

    #[error("user already has active session {0}")]
    ActiveSessionExists(Uuid),
}
