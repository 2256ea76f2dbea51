//! # EV Bridge OCPP
//!
//! OCPP 1.6-J central system for a single charge point, bridged to an MQTT
//! control and telemetry bus (Home Assistant discovery layout).
//!
//! ## Architecture
//!
//! ```text
//! Charge point
//!       │ WebSocket, ocpp1.6
//!       ▼
//! ┌──────────────────────────────────────┐
//! │  OcppServer (reader / writer tasks)  │
//! │            │ SessionMessage          │
//! │            ▼                         │
//! │  ChargePointSession actor ──► TransactionStore
//! │    │ build_schedule    ▲             │
//! │    │                   │ Command     │
//! │    ▼                   │             │
//! │  Telemetry        CommandBridge ◄─ SessionRegistry
//! └────┬───────────────────▲─────────────┘
//!      │ retained publish  │ ocpp/<control>_<id>/set
//!      ▼                   │
//!            MQTT broker
//! ```
//!
//! ## Command topics
//!
//! | Topic | Payload | Effect |
//! |-------|---------|--------|
//! | `ocpp/suspend_<id>/set` | `ON` / other | profile at 0 A / resume |
//! | `ocpp/resume_<id>/set` | any | profile at the operating limit |
//! | `ocpp/unlock_cable_<id>/press` | any | UnlockConnector (not while charging) |
//! | `ocpp/availability_<id>/set` | `ON` / other | ChangeAvailability |
//! | `ocpp/current_limit_<id>/set` | amps | new operating limit |
//!
//! All commands are dropped unless `allow_writeback` is set.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use evbridge_ocpp::{BridgeConfig, CommandBridge, MqttBus, OcppServer, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::load("config.json")?;
//!
//!     let registry = Arc::new(SessionRegistry::new());
//!     let bridge = CommandBridge::new(registry.clone(), config.allow_writeback);
//!     let bus = MqttBus::connect(&config.mqtt, Arc::new(move |topic: &str, payload: &str| {
//!         bridge.handle(topic, payload)
//!     }))?;
//!
//!     OcppServer::new(config.server_config(), registry, Arc::new(bus)).run().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod ocpp;
pub mod persistence;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod telemetry;

pub use bridge::CommandBridge;
pub use config::{BridgeConfig, ConfigError};
pub use error::{CommandError, SessionError};
pub use mqtt::{BusError, MqttBus};
pub use ocpp::{OcppError, OcppSender, OcppServer, OcppServerConfig};
pub use persistence::TransactionStore;
pub use registry::SessionRegistry;
pub use schedule::{build_schedule, BuiltSchedule};
pub use session::{ChargePointSession, Command, SessionHandle, SessionSettings};
pub use telemetry::{Telemetry, TelemetrySink};
