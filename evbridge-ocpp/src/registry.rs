//! Live sessions keyed by charge point identity

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::session::SessionHandle;

/// Map from charge point identity to its running session.
///
/// Written by the OCPP listener on connect/disconnect, read by the bus
/// delivery thread for every command.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous one for the same identity
    pub fn register(&self, handle: SessionHandle) {
        let identity = handle.identity().to_string();
        if self.sessions.write().insert(identity.clone(), handle).is_some() {
            warn!("Replaced existing session for charge point {}", identity);
        } else {
            info!("Registered session for charge point {}", identity);
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.read().get(identity).cloned()
    }

    /// Remove `handle`'s entry, unless a newer connection already took its place
    pub fn remove(&self, handle: &SessionHandle) {
        let mut sessions = self.sessions.write();
        let same = sessions
            .get(handle.identity())
            .map(|current| current.same_session(handle))
            .unwrap_or(false);
        if same {
            sessions.remove(handle.identity());
            info!("Removed session for charge point {}", handle.identity());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
