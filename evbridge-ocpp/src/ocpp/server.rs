//! OCPP 1.6-J WebSocket listener
//!
//! Accepts charge point connections, negotiates the `ocpp1.6` subprotocol and
//! runs one session actor per connection. Each connection has:
//! - a reader loop that resolves pending outbound calls and forwards inbound
//!   CALLs to the session actor,
//! - a writer task that serializes frames onto the socket,
//! - a [`ConnectionHandle`] the session uses to issue its own calls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::messages::*;
use super::OcppSender;
use crate::error::SessionError;
use crate::persistence::{TransactionStore, DEFAULT_PERSIST_PATH};
use crate::registry::SessionRegistry;
use crate::session::{CallReply, ChargePointSession, SessionHandle, SessionSettings};
use crate::telemetry::TelemetrySink;

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Listener configuration
#[derive(Debug, Clone)]
pub struct OcppServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Identity assigned to accepted charge points
    pub charge_point_id: String,
    /// Outbound call timeout
    pub request_timeout: Duration,
    /// Settings handed to every new session
    pub session: SessionSettings,
    /// Transaction record location
    pub persist_path: PathBuf,
}

impl Default for OcppServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            charge_point_id: "CP_1".to_string(),
            request_timeout: Duration::from_secs(30),
            session: SessionSettings::default(),
            persist_path: PathBuf::from(DEFAULT_PERSIST_PATH),
        }
    }
}

impl OcppServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Result<CallResult, OcppError>>>>>;

/// Outbound half of one charge point connection
pub struct ConnectionHandle {
    identity: String,
    outgoing: mpsc::UnboundedSender<OcppMessage>,
    pending: PendingCalls,
    request_timeout: Duration,
}

#[async_trait]
impl OcppSender for ConnectionHandle {
    async fn call(&self, call: Call) -> Result<CallResult, OcppError> {
        let (response_tx, response_rx) = oneshot::channel();
        let message_id = call.message_id.clone();

        self.pending.lock().insert(message_id.clone(), response_tx);

        debug!("{}: sending {} ({})", self.identity, call.action, message_id);
        if self.outgoing.send(OcppMessage::Call(call)).is_err() {
            self.pending.lock().remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&message_id);
                Err(OcppError::Timeout)
            }
        }
    }
}

/// CALLERROR code reported for a failed inbound call
fn error_code(e: &SessionError) -> ErrorCode {
    match e {
        SessionError::UnsupportedAction(_) => ErrorCode::NotImplemented,
        SessionError::InvalidPayload { .. } => ErrorCode::FormationViolation,
        _ => ErrorCode::InternalError,
    }
}

/// Frame answering an inbound call
fn reply_frame(message_id: String, reply: CallReply) -> OcppMessage {
    match reply {
        Ok(payload) => OcppMessage::CallResult(CallResult {
            message_id,
            payload,
        }),
        Err(e) => OcppMessage::CallError(CallError::new(message_id, error_code(&e), e.to_string())),
    }
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == OCPP_SUBPROTOCOL)
}

/// OCPP central-system listener
pub struct OcppServer {
    config: Arc<OcppServerConfig>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn TelemetrySink>,
}

impl OcppServer {
    pub fn new(
        config: OcppServerConfig,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            sink,
        }
    }

    pub fn config(&self) -> &OcppServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(&self) -> Result<(), OcppError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        info!("OCPP server started on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), OcppError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("New connection from {}", peer);

            let config = self.config.clone();
            let registry = self.registry.clone();
            let sink = self.sink.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(config, registry, sink, stream, peer).await {
                    error!("Connection error from {}: {}", peer, e);
                }
                info!("Connection closed for {}", peer);
            });
        }
    }
}

async fn handle_connection(
    config: Arc<OcppServerConfig>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn TelemetrySink>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), OcppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 * 1024),
        max_frame_size: Some(16 * 1024),
        ..Default::default()
    };

    let mut request_path = String::new();
    let ws_stream = accept_hdr_async_with_config(
        stream,
        |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            request_path = request.uri().path().to_string();
            if offers_subprotocol(request) {
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            } else {
                warn!("{} did not offer the {} subprotocol", peer, OCPP_SUBPROTOCOL);
            }
            Ok(response)
        },
        Some(ws_config),
    )
    .await?;

    let identity = config.charge_point_id.clone();
    info!("{}: charge point connected from {} (path {})", identity, peer, request_path);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OcppMessage>();
    let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

    let connection = Arc::new(ConnectionHandle {
        identity: identity.clone(),
        outgoing: outgoing_tx.clone(),
        pending: pending.clone(),
        request_timeout: config.request_timeout,
    });

    let session = ChargePointSession::new(
        identity.clone(),
        config.session.clone(),
        connection,
        sink.clone(),
        TransactionStore::new(&config.persist_path),
    );
    session.announce();
    sink.subscribe_controls(&identity);
    let (handle, actor) = session.spawn();
    registry.register(handle.clone());

    // Writer task
    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            let bytes = match msg.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    error!("{}: failed to serialize message: {}", writer_identity, e);
                    continue;
                }
            };

            debug!("{}: sending {}", writer_identity, String::from_utf8_lossy(&bytes));

            if let Err(e) = ws_tx
                .send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()))
                .await
            {
                error!("{}: failed to send WebSocket message: {}", writer_identity, e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader loop
    let result = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("{}: received {}", identity, text);
                route_frame(&identity, text.as_bytes(), &handle, &pending, &outgoing_tx);
            }
            Some(Ok(Message::Binary(_))) => {
                warn!("{}: ignoring binary frame", identity);
            }
            Some(Ok(Message::Close(_))) => {
                info!("{}: WebSocket closed by charge point", identity);
                break Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Err(OcppError::from(e)),
            None => {
                info!("{}: WebSocket stream ended", identity);
                break Ok(());
            }
        }
    };

    registry.remove(&handle);
    pending.lock().clear();
    actor.abort();
    writer.abort();

    result
}

/// Dispatch one text frame from the charge point
fn route_frame(
    identity: &str,
    bytes: &[u8],
    session: &SessionHandle,
    pending: &PendingCalls,
    outgoing: &mpsc::UnboundedSender<OcppMessage>,
) {
    match OcppMessage::parse(bytes) {
        Ok(OcppMessage::Call(call)) => {
            let message_id = call.message_id.clone();
            match session.deliver(call) {
                Ok(reply_rx) => {
                    // The actor may itself be waiting on a CALLRESULT only
                    // this loop can route, so the reply is awaited elsewhere.
                    let outgoing = outgoing.clone();
                    let identity = identity.to_string();
                    tokio::spawn(async move {
                        let reply = reply_rx
                            .await
                            .unwrap_or_else(|_| Err(SessionError::SessionClosed(identity)));
                        let _ = outgoing.send(reply_frame(message_id, reply));
                    });
                }
                Err(e) => {
                    let _ = outgoing.send(reply_frame(message_id, Err(e)));
                }
            }
        }
        Ok(OcppMessage::CallResult(result)) => {
            match pending.lock().remove(&result.message_id) {
                Some(tx) => {
                    let _ = tx.send(Ok(result));
                }
                None => warn!("{}: unexpected CALLRESULT {}", identity, result.message_id),
            }
        }
        Ok(OcppMessage::CallError(err)) => {
            match pending.lock().remove(&err.message_id) {
                Some(tx) => {
                    let _ = tx.send(Err(OcppError::RemoteError {
                        code: err.error_code,
                        description: err.error_description,
                        details: err.error_details,
                    }));
                }
                None => warn!("{}: unexpected CALLERROR {}", identity, err.message_id),
            }
        }
        Err(e) => {
            warn!("{}: failed to parse OCPP message: {}", identity, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tokio_tungstenite::{
        connect_async, tungstenite::client::IntoClientRequest, MaybeTlsStream, WebSocketStream,
    };

    use super::*;
    use crate::ocpp::AvailabilityType;
    use crate::session::Command;
    use crate::telemetry::testing::RecordingSink;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(
        dir: &std::path::Path,
    ) -> (SocketAddr, Arc<SessionRegistry>, Arc<RecordingSink>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let sink = Arc::new(RecordingSink::default());

        let config = OcppServerConfig {
            charge_point_id: "CP1".into(),
            request_timeout: Duration::from_secs(5),
            persist_path: dir.join("persist.json"),
            ..Default::default()
        };
        let server = OcppServer::new(config, registry.clone(), sink.clone());
        tokio::spawn(async move { server.serve(listener).await });

        (addr, registry, sink)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let mut request = format!("ws://{}/CP1", addr).into_client_request().unwrap();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        let (client, response) = connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            OCPP_SUBPROTOCOL
        );
        client
    }

    async fn send(client: &mut Client, frame: Value) {
        client.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    async fn next_frame(client: &mut Client) -> Value {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_error_codes_for_failed_calls() {
        assert_eq!(
            error_code(&SessionError::UnsupportedAction("DataTransfer".into())),
            ErrorCode::NotImplemented
        );
        assert_eq!(
            error_code(&SessionError::SessionClosed("CP1".into())),
            ErrorCode::InternalError
        );
    }

    #[tokio::test]
    async fn test_boot_and_unsupported_action() {
        let dir = tempdir().unwrap();
        let (addr, registry, sink) = start_server(dir.path()).await;
        let mut client = connect(addr).await;

        send(
            &mut client,
            json!([2, "boot-1", "BootNotification", {"chargePointVendor": "Acme", "chargePointModel": "W1"}]),
        )
        .await;
        let reply = next_frame(&mut client).await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "boot-1");
        assert_eq!(reply[2]["status"], "Accepted");
        assert_eq!(reply[2]["interval"], 30);

        send(&mut client, json!([2, "dt-1", "DataTransfer", {"vendorId": "x"}])).await;
        let reply = next_frame(&mut client).await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "dt-1");
        assert_eq!(reply[2], "NotImplemented");

        assert!(registry.lookup("CP1").is_some());
        assert_eq!(sink.subscribed.lock().clone(), vec!["CP1".to_string()]);
        assert_eq!(sink.last_value("ocpp/status_CP1").as_deref(), Some("Booted"));
    }

    #[tokio::test]
    async fn test_outbound_call_round_trip() {
        let dir = tempdir().unwrap();
        let (addr, registry, sink) = start_server(dir.path()).await;
        let mut client = connect(addr).await;

        // Registration happens right after the handshake
        let handle = loop {
            if let Some(handle) = registry.lookup("CP1") {
                break handle;
            }
            tokio::task::yield_now().await;
        };
        handle
            .submit(Command::ChangeAvailability(AvailabilityType::Inoperative))
            .unwrap();

        let call = next_frame(&mut client).await;
        assert_eq!(call[0], 2);
        assert_eq!(call[2], "ChangeAvailability");
        assert_eq!(call[3], json!({"connectorId": 0, "type": "Inoperative"}));

        let message_id = call[1].as_str().unwrap().to_string();
        send(&mut client, json!([3, message_id, {"status": "Accepted"}])).await;

        // An inbound call after the reply proves the actor is free again
        send(&mut client, json!([2, "hb-1", "Heartbeat", {}])).await;
        let reply = next_frame(&mut client).await;
        assert_eq!(reply[1], "hb-1");
        assert!(reply[2]["currentTime"].is_string());
        assert_eq!(sink.last_value("ocpp/availability_CP1/state").as_deref(), Some("OFF"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let dir = tempdir().unwrap();
        let (addr, registry, _) = start_server(dir.path()).await;
        let mut client = connect(addr).await;

        send(&mut client, json!([2, "hb-1", "Heartbeat", {}])).await;
        next_frame(&mut client).await;
        assert!(registry.lookup("CP1").is_some());

        client.close(None).await.unwrap();
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
    }
}
