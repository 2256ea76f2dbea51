//! MQTT bus adapter
//!
//! [`MqttBus`] implements [`TelemetrySink`] over a synchronous rumqttc client.
//! Two threads serve the bus: `mqtt-delivery` drives the connection and hands
//! every incoming publish to the command callback, `mqtt-publish` drains an
//! unbounded outbox into the client. Publishes are retained, QoS 1, and never
//! block or get dropped on the caller's side; the publish thread waits for
//! room in the client's request queue instead.

use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::telemetry::{Control, TelemetrySink};

/// How long startup waits for the broker to acknowledge the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before the event loop retries after a dropped connection
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the client's request queue
const REQUEST_CAPACITY: usize = 64;

/// Errors from the MQTT bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("MQTT connection to {broker}:{port} failed: {reason}")]
    Connect {
        broker: String,
        port: u16,
        reason: String,
    },

    #[error("MQTT broker {0} did not acknowledge the connection in time")]
    Timeout(String),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Callback invoked on the delivery thread for each incoming message
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Request queued for the publish thread
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outgoing {
    Publish { topic: String, payload: String },
    Subscribe(String),
}

/// Command topics subscribed for one charge point
pub fn control_topics(identity: &str) -> Vec<String> {
    Control::ALL
        .iter()
        .map(|control| control.command_topic(identity))
        .collect()
}

/// Client options for `config`
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    options
}

/// Connected MQTT bus
#[derive(Clone)]
pub struct MqttBus {
    outbox: mpsc::UnboundedSender<Outgoing>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MqttBus {
    /// Connect to the broker and start the delivery and publish threads.
    ///
    /// Blocks until the broker acknowledged the connection. Any failure
    /// before that point is returned; later disconnects are retried by the
    /// delivery thread.
    pub fn connect(config: &MqttConfig, on_message: MessageHandler) -> Result<Self, BusError> {
        info!("Connecting to MQTT broker {}:{}", config.broker, config.port);

        let spawn_failed = |e: std::io::Error| BusError::Connect {
            broker: config.broker.clone(),
            port: config.port,
            reason: e.to_string(),
        };

        let (client, connection) = Client::new(mqtt_options(config), REQUEST_CAPACITY);
        let (outbox, queued) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel();

        thread::Builder::new()
            .name("mqtt-publish".to_string())
            .spawn(move || publish_loop(client, queued))
            .map_err(spawn_failed)?;

        let thread_outbox = outbox.clone();
        let thread_subscriptions = subscriptions.clone();
        thread::Builder::new()
            .name("mqtt-delivery".to_string())
            .spawn(move || {
                delivery_loop(connection, thread_outbox, thread_subscriptions, on_message, ready_tx)
            })
            .map_err(spawn_failed)?;

        match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => {
                info!("Connected to MQTT broker {}:{}", config.broker, config.port);
                Ok(Self {
                    outbox,
                    subscriptions,
                })
            }
            Ok(Err(reason)) => Err(BusError::Connect {
                broker: config.broker.clone(),
                port: config.port,
                reason,
            }),
            Err(_) => Err(BusError::Timeout(config.broker.clone())),
        }
    }

    fn enqueue(&self, request: Outgoing) {
        if let Err(e) = self.outbox.send(request) {
            warn!("MQTT publish thread stopped, dropping {:?}", e.0);
        }
    }
}

impl TelemetrySink for MqttBus {
    fn publish(&self, topic: &str, payload: &str) {
        debug!("Publishing {} to {}", payload, topic);
        self.enqueue(Outgoing::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    fn subscribe_controls(&self, identity: &str) {
        for topic in control_topics(identity) {
            {
                let mut subscriptions = self.subscriptions.lock();
                if !subscriptions.contains(&topic) {
                    subscriptions.push(topic.clone());
                }
            }
            self.enqueue(Outgoing::Subscribe(topic));
        }
    }
}

/// Hand queued requests to the client in order, waiting for queue room
fn publish_loop(client: Client, mut queued: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(request) = queued.blocking_recv() {
        let result = match &request {
            Outgoing::Publish { topic, payload } => {
                client.publish(topic.as_str(), QoS::AtLeastOnce, true, payload.as_bytes().to_vec())
            }
            Outgoing::Subscribe(topic) => {
                debug!("Subscribing to {}", topic);
                client.subscribe(topic.as_str(), QoS::AtLeastOnce)
            }
        };
        if let Err(e) = result {
            error!("MQTT event loop gone, stopping publish thread: {}", e);
            return;
        }
    }

    debug!("MQTT publish thread stopped");
}

/// Drive the connection until the client is dropped
fn delivery_loop(
    mut connection: Connection,
    outbox: mpsc::UnboundedSender<Outgoing>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    on_message: MessageHandler,
    ready: std_mpsc::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    error!("{}", reason);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(reason));
                        return;
                    }
                    continue;
                }

                info!("Connected to MQTT broker");
                // Clean sessions drop subscriptions on every reconnect
                for topic in subscriptions.lock().iter() {
                    let _ = outbox.send(Outgoing::Subscribe(topic.clone()));
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                debug!("Received {} on {}", payload, publish.topic);
                on_message(&publish.topic, &payload);
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e.to_string()));
                    return;
                }
                warn!("Disconnected from MQTT broker: {}", e);
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }

    debug!("MQTT delivery thread stopped");
}
