//! Session-based routing of freshly ingested notifications.
//!
//! A notification goes to every user whose open work session includes the
//! notification's cabinet at the moment of routing. Sessions closed before
//! that moment are never considered.

use crate::models::{Notification, UserId};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SessionRouter {
    store: Arc<Store>,
}

impl SessionRouter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Users with an open session monitoring `cabinet_id`, ascending
    pub fn recipients(&self, cabinet_id: &str) -> Result<Vec<UserId>, StoreError> {
        let cabinet_id = cabinet_id.trim();
        if cabinet_id.is_empty() {
            return Ok(Vec::new());
        }

        let mut users: Vec<UserId> = self
            .store
            .active_sessions_with_cabinet(cabinet_id)?
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    /// Give each recipient its own copy of a stored notification.
    ///
    /// Returns the recipient-scoped rows; empty when nobody is monitoring the
    /// cabinet, in which case the base row stays unowned.
    pub async fn route(&self, notification: &Notification) -> Result<Vec<Notification>, StoreError> {
        let recipients = self.recipients(&notification.cabinet_id)?;

        let mut copies = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            copies.push(self.store.assign_recipient(notification.id, user_id).await?);
        }

        debug!(
            id = notification.id,
            recipients = copies.len(),
            "Routed notification"
        );
        Ok(copies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{CabinetLink, StartWorkRequest};
    use crate::sessions::Sessions;
    use chrono::Utc;

    fn setup() -> (Arc<Store>, Sessions, SessionRouter) {
        let store = Arc::new(Store::new(&Config::default()));
        (
            store.clone(),
            Sessions::new(store.clone()),
            SessionRouter::new(store),
        )
    }

    fn watching(cabinet: &str) -> StartWorkRequest {
        StartWorkRequest {
            comment: None,
            cabinets: vec![CabinetLink {
                idex_id: cabinet.to_string(),
                login: String::new(),
            }],
        }
    }

    #[test]
    fn recipients_only_from_open_sessions() {
        let (_, sessions, router) = setup();
        sessions.start_work(1, watching("42"), Utc::now()).unwrap();
        let closed = sessions.start_work(2, watching("42"), Utc::now()).unwrap();
        sessions.start_work(3, watching("99"), Utc::now()).unwrap();
        sessions.end_work(2, closed.id, Utc::now()).unwrap();

        assert_eq!(router.recipients("42").unwrap(), vec![1]);
        assert_eq!(router.recipients("99").unwrap(), vec![3]);
        assert!(router.recipients("7").unwrap().is_empty());
        assert!(router.recipients("  ").unwrap().is_empty());
    }
}
