//! Error types for session handling and command routing

use thiserror::Error;

use crate::ocpp::OcppError;

/// Failure while handling an inbound protocol event or executing a command
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no handler registered for OCPP action: {0}")]
    UnsupportedAction(String),

    #[error("invalid {action} payload: {source}")]
    InvalidPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error("session {0} is no longer running")]
    SessionClosed(String),
}

/// Reasons a bus command is dropped before reaching a session
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command topic: {0}")]
    UnknownTopic(String),

    #[error("invalid payload for {topic}: {payload:?}")]
    InvalidPayload { topic: String, payload: String },

    #[error("no session registered for charge point {0}")]
    UnknownSession(String),

    #[error("write access disabled, ignoring {0}")]
    WriteAccessDisabled(String),

    #[error("session {0} is no longer running")]
    SessionClosed(String),
}
