//! OCPP-J message framing
//!
//! OCPP 1.6-J carries RPC frames as JSON arrays over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// OCPP 1.6 action names handled or issued by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CS
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    StartTransaction,
    StopTransaction,

    // CS -> CP
    SetChargingProfile,
    RemoteStopTransaction,
    UnlockConnector,
    ChangeAvailability,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::UnlockConnector => "UnlockConnector",
            Action::ChangeAvailability => "ChangeAvailability",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("OCPP error from charge point: {code:?} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// OCPP CALL message (request)
///
/// The action is kept as the raw wire name so that an unsupported inbound
/// action can still be answered with a CALLERROR carrying its message id.
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or(OcppError::InvalidFormat)?
            .to_string();

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?;

                let error_code: ErrorCode = serde_json::from_value(
                    Value::String(error_code_str.to_string())
                ).unwrap_or(ErrorCode::GenericError);

                let error_description = array[3]
                    .as_str()
                    .unwrap_or("")
                    .to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::UnlockConnectorRequest;

    #[test]
    fn test_call_serialization() {
        let call = Call::new(Action::UnlockConnector, UnlockConnectorRequest { connector_id: 1 }).unwrap();
        let text = String::from_utf8(call.to_bytes().unwrap()).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"UnlockConnector\""));
        assert!(text.contains("\"connectorId\":1"));
    }

    #[test]
    fn test_call_parsing_keeps_unknown_action() {
        let json = r#"[2, "msg-123", "DiagnosticsStatusNotification", {"status": "Idle"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "DiagnosticsStatusNotification");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"status": "Accepted"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                assert_eq!(result.payload["status"], "Accepted");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_call_error_serialization() {
        let error = CallError::new("m-1".into(), ErrorCode::NotImplemented, "no handler");
        let text = String::from_utf8(error.to_bytes().unwrap()).unwrap();
        assert_eq!(text, r#"[4,"m-1","NotImplemented","no handler",{}]"#);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(OcppMessage::parse(b"[]").is_err());
        assert!(OcppMessage::parse(br#"[2, "id", "Heartbeat"]"#).is_err());
        assert!(matches!(
            OcppMessage::parse(br#"[9, "id", {}]"#),
            Err(OcppError::UnknownMessageType(9))
        ));
    }
}
