//! Work session lifecycle.
//!
//! A session records which cabinets a user is monitoring. Only open sessions
//! take part in routing; cabinets can be linked or unlinked whether the
//! session is open or closed.

use crate::models::{CabinetLink, StartWorkRequest, UserId, WorkSession};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct Sessions {
    store: Arc<Store>,
}

impl Sessions {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open a session for `user_id`, linking the requested cabinets.
    pub fn start_work(
        &self,
        user_id: UserId,
        req: StartWorkRequest,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        let mut cabinets = BTreeSet::new();
        for link in &req.cabinets {
            let idex_id = link.idex_id.trim();
            if idex_id.is_empty() {
                return Err(SessionError::InvalidCabinet);
            }
            self.store.upsert_cabinet(idex_id, &link.login)?;
            cabinets.insert(idex_id.to_string());
        }

        let session = WorkSession {
            id: Uuid::new_v4(),
            user_id,
            start_time: now,
            end_time: None,
            duration: None,
            cabinets,
            comment: req.comment.filter(|c| !c.trim().is_empty()),
        };

        self.store
            .open_session(session.clone())
            .map_err(|e| match e {
                StoreError::ActiveSessionExists(id) => SessionError::AlreadyActive(id),
                other => SessionError::Store(other),
            })?;

        info!(
            session_id = %session.id,
            user_id,
            cabinets = session.cabinets.len(),
            "Work session started"
        );
        Ok(session)
    }

    /// The user's open session, if any
    pub fn active_session(&self, user_id: UserId) -> Result<Option<WorkSession>, SessionError> {
        Ok(self.store.active_session(user_id)?)
    }

    /// Link a cabinet to a session
    pub fn add_cabinet(
        &self,
        user_id: UserId,
        session_id: Uuid,
        link: &CabinetLink,
    ) -> Result<WorkSession, SessionError> {
        let idex_id = link.idex_id.trim();
        if idex_id.is_empty() {
            return Err(SessionError::InvalidCabinet);
        }
        self.owned_session(user_id, session_id)?;
        self.store.upsert_cabinet(idex_id, &link.login)?;

        self.store
            .update_session_cabinets(session_id, |cabinets| {
                cabinets.insert(idex_id.to_string());
            })?
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Unlink a cabinet from a session
    pub fn remove_cabinet(
        &self,
        user_id: UserId,
        session_id: Uuid,
        idex_id: &str,
    ) -> Result<WorkSession, SessionError> {
        self.owned_session(user_id, session_id)?;
        self.store
            .update_session_cabinets(session_id, |cabinets| {
                cabinets.remove(idex_id.trim());
            })?
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Close a session and record its duration
    pub fn end_work(
        &self,
        user_id: UserId,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkSession, SessionError> {
        self.owned_session(user_id, session_id)?;
        let session = self
            .store
            .close_session(session_id, now)?
            .ok_or(SessionError::NotFound(session_id))?;

        info!(
            session_id = %session.id,
            user_id,
            duration_secs = session.duration,
            "Work session ended"
        );
        Ok(session)
    }

    fn owned_session(&self, user_id: UserId, session_id: Uuid) -> Result<WorkSession, SessionError> {
        let session = self
            .store
            .session(session_id)?
            .ok_or(SessionError::NotFound(session_id))?;
        if session.user_id != user_id {
            return Err(SessionError::NotOwner);
        }
        Ok(session)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("user already has an active session {0}")]
    AlreadyActive(Uuid),

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("session belongs to another user")]
    NotOwner,

    #[error("cabinet id must not be empty")]
    InvalidCabinet,

    #[error(transparent)]
    Store(#[from] StoreError),
}
