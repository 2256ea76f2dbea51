//! OCPP 1.6-J protocol layer
//!
//! - `types`: OCPP 1.6 payloads
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `server`: WebSocket listener and per-connection call correlation

pub mod types;
pub mod messages;
pub mod server;

use async_trait::async_trait;

pub use types::*;
pub use messages::*;
pub use server::{OcppServer, OcppServerConfig};

/// Outbound half of a charge point connection.
///
/// Sends a CALL and resolves with the matching CALLRESULT. A CALLERROR from
/// the charge point surfaces as [`OcppError::RemoteError`].
#[async_trait]
pub trait OcppSender: Send + Sync {
    async fn call(&self, call: Call) -> Result<CallResult, OcppError>;
}
