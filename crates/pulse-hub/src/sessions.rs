//! Live agent connections
//!
//! Each connection gets a session id and an outbound queue drained by its
//! socket writer. A session is bound to at most one validator, and only
//! after a verified signup on that same session.

use pulse_core::protocol::HubMessage;
use pulse_core::ValidatorId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, RwLock};

pub type SessionId = u64;

struct SessionEntry {
    validator_id: Option<ValidatorId>,
    outbound: mpsc::UnboundedSender<HubMessage>,
}

/// Outcome of binding a session to a validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    Bound,
    /// Already bound to this validator
    Unchanged,
    /// Bound to a different validator; left as is
    Conflict(ValidatorId),
    UnknownSession,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
}

impl SessionTable {
    pub async fn register(&self, outbound: mpsc::UnboundedSender<HubMessage>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.write().await.insert(
            id,
            SessionEntry {
                validator_id: None,
                outbound,
            },
        );
        id
    }

    pub async fn bind(&self, session_id: SessionId, validator_id: &str) -> Bind {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&session_id) else {
            return Bind::UnknownSession;
        };
        match &entry.validator_id {
            Some(existing) if existing == validator_id => Bind::Unchanged,
            Some(existing) => Bind::Conflict(existing.clone()),
            None => {
                entry.validator_id = Some(validator_id.to_string());
                Bind::Bound
            }
        }
    }

    /// Drop a session, returning the validator it was bound to
    pub async fn remove(&self, session_id: SessionId) -> Option<ValidatorId> {
        self.sessions
            .write()
            .await
            .remove(&session_id)
            .and_then(|entry| entry.validator_id)
    }

    pub async fn validator_of(&self, session_id: SessionId) -> Option<ValidatorId> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .and_then(|entry| entry.validator_id.clone())
    }

    /// Queue a frame for a session; false if the session is gone
    pub async fn send(&self, session_id: SessionId, message: HubMessage) -> bool {
        match self.sessions.read().await.get(&session_id) {
            Some(entry) => entry.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Pick up to `count` distinct online validators, rotating the start
    ///
    /// Candidates are ordered by session id and the starting point advances
    /// on every call, so repeated rounds spread work across all agents.
    pub async fn select(&self, count: usize) -> Vec<(SessionId, ValidatorId)> {
        let sessions = self.sessions.read().await;

        let mut candidates: Vec<(SessionId, ValidatorId)> = sessions
            .iter()
            .filter_map(|(id, entry)| entry.validator_id.clone().map(|v| (*id, v)))
            .collect();
        candidates.sort_by_key(|(id, _)| *id);

        // One session per validator
        let mut seen = HashSet::new();
        candidates.retain(|(_, validator_id)| seen.insert(validator_id.clone()));

        if candidates.is_empty() {
            return Vec::new();
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates
            .iter()
            .cycle()
            .skip(start)
            .take(count.min(candidates.len()))
            .cloned()
            .collect()
    }

    pub async fn online_validators(&self) -> HashSet<ValidatorId> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|entry| entry.validator_id.clone())
            .collect()
    }
}
