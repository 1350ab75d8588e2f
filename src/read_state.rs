//! Read/unread state.
//!
//! Notifications are read per recipient copy; cancellations are read
//! globally. While the schema is missing every read returns nothing and every
//! mark is a silent no-op, so an unprovisioned notification store never
//! breaks the host dashboard.

use crate::models::{AlertId, Cancellation, Cursor, Notification, NotificationPage, UserId};
use crate::store::{MarkOutcome, Store, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct ReadState {
    store: Arc<Store>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadStateError {
    #[error("notification {0} belongs to another user")]
    Forbidden(AlertId),

    #[error("item {0} not found")]
    NotFound(AlertId),

    #[error("malformed pagination cursor")]
    InvalidCursor,

    #[error(transparent)]
    Store(StoreError),
}

/// Empty result for an unprovisioned schema; other errors are logged and
/// also degrade to empty.
fn degrade<T: Default>(result: Result<T, StoreError>, op: &'static str) -> T {
    match result {
        Ok(value) => value,
        Err(StoreError::SchemaNotReady) => {
            debug!(op, "Schema not ready, returning empty result");
            T::default()
        }
        Err(e) => {
            warn!(op, error = %e, "Read-state query failed");
            T::default()
        }
    }
}

impl ReadState {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // === Notifications ===

    /// Mark the caller's own notification as read
    pub fn mark_as_read(&self, user_id: UserId, id: AlertId) -> Result<(), ReadStateError> {
        match self.store.mark_notification_read(user_id, id) {
            Ok(MarkOutcome::Marked) | Err(StoreError::SchemaNotReady) => Ok(()),
            Ok(MarkOutcome::NotOwner) => {
                warn!(user_id, id, "Refused to mark another user's notification");
                Err(ReadStateError::Forbidden(id))
            }
            Ok(MarkOutcome::NotFound) => Err(ReadStateError::NotFound(id)),
            Err(e) => Err(ReadStateError::Store(e)),
        }
    }

    /// Mark all of the caller's notifications as read; returns how many changed
    pub fn mark_all_as_read(&self, user_id: UserId) -> usize {
        degrade(
            self.store.mark_all_notifications_read(user_id),
            "mark_all_as_read",
        )
    }

    pub fn unread_list(&self, user_id: UserId) -> Vec<Notification> {
        degrade(self.store.user_notifications(user_id), "unread_list")
            .into_iter()
            .filter(|n| !n.is_read)
            .collect()
    }

    pub fn unread_count(&self, user_id: UserId) -> usize {
        self.unread_list(user_id).len()
    }

    /// Newest-first page of the caller's notifications, read or not
    pub fn all_notifications(
        &self,
        user_id: UserId,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<NotificationPage, ReadStateError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let cursor = match cursor {
            Some(raw) => Some(Cursor::decode(raw).ok_or(ReadStateError::InvalidCursor)?),
            None => None,
        };

        let mut items: Vec<Notification> =
            degrade(self.store.user_notifications(user_id), "all_notifications")
                .into_iter()
                .filter(|n| cursor.as_ref().map_or(true, |c| c.precedes(n.timestamp, n.id)))
                .take(limit + 1)
                .collect();

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|n| {
                Cursor {
                    timestamp: n.timestamp,
                    id: n.id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(NotificationPage { items, next_cursor })
    }

    // === Cancellations ===

    /// Mark a cancellation as read (no owner check)
    pub fn mark_cancellation_as_read(&self, id: AlertId) -> Result<(), ReadStateError> {
        match self.store.mark_cancellation_read(id) {
            Ok(true) | Err(StoreError::SchemaNotReady) => Ok(()),
            Ok(false) => Err(ReadStateError::NotFound(id)),
            Err(e) => Err(ReadStateError::Store(e)),
        }
    }

    pub fn mark_all_cancellations_as_read(&self) -> usize {
        degrade(
            self.store.mark_all_cancellations_read(),
            "mark_all_cancellations_as_read",
        )
    }

    pub fn unread_cancellations(&self) -> Vec<Cancellation> {
        degrade(self.store.cancellations(), "unread_cancellations")
            .into_iter()
            .filter(|c| !c.is_read)
            .collect()
    }

    pub fn unread_cancellations_count(&self) -> usize {
        self.unread_cancellations().len()
    }
}
