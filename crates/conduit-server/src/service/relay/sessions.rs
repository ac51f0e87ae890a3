use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conduit_core::{Error, Result};
use uuid::Uuid;

use super::session::{RelaySession, SessionLimits, TRACING_TARGET};
use crate::lock;
use crate::service::ServiceConfig;

/// Relay sessions of this node, keyed by session id.
#[derive(Clone)]
pub struct RelaySessions {
    sessions: Arc<Mutex<HashMap<Uuid, RelaySession>>>,
    limits: SessionLimits,
    max_sessions: usize,
}

impl RelaySessions {
    /// Creates an empty session table.
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            limits: SessionLimits {
                command_timeout: config.relay_command_timeout(),
                stream_buffer: config.relay_stream_buffer,
                control_buffer: config.relay_control_buffer,
            },
            max_sessions: config.max_sessions,
        }
    }

    /// Opens a session for a terminal.
    pub fn create(&self, label: Option<String>) -> Result<RelaySession> {
        let mut sessions = lock(&self.sessions);
        if sessions.len() >= self.max_sessions {
            return Err(Error::invalid_state(format!(
                "relay session limit of {} reached",
                self.max_sessions
            )));
        }

        let session = RelaySession::new(label, self.limits);
        sessions.insert(session.id(), session.clone());

        tracing::info!(
            target: TRACING_TARGET,
            session_id = %session.id(),
            label = session.label().unwrap_or_default(),
            "Relay session opened"
        );
        Ok(session)
    }

    /// Returns a session.
    pub fn get(&self, session_id: Uuid) -> Result<RelaySession> {
        lock(&self.sessions)
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("relay session '{session_id}' not found")))
    }

    /// Removes a session from the table. The caller closes it.
    pub fn remove(&self, session_id: Uuid) -> Result<RelaySession> {
        lock(&self.sessions)
            .remove(&session_id)
            .ok_or_else(|| Error::not_found(format!("relay session '{session_id}' not found")))
    }

    /// Lists every session, oldest first.
    pub fn list(&self) -> Vec<RelaySession> {
        let mut sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        sessions.sort_by_key(|session| session.created_at());
        sessions
    }

    /// Returns the number of open sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Returns `true` if no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and removes every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for RelaySessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySessions")
            .field("sessions", &self.len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::ErrorKind;

    use super::*;

    #[test]
    fn sessions_are_bounded() -> anyhow::Result<()> {
        let config = ServiceConfig::builder().with_max_sessions(2usize).build()?;
        let sessions = RelaySessions::new(&config);

        let first = sessions.create(Some("a".into()))?;
        let _second = sessions.create(None)?;
        assert_eq!(sessions.create(None).unwrap_err().kind(), ErrorKind::InvalidState);

        assert_eq!(sessions.get(first.id())?.label(), Some("a"));
        sessions.remove(first.id())?;
        assert_eq!(sessions.get(first.id()).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(sessions.len(), 1);
        Ok(())
    }
}
