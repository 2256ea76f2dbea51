//! Telemetry topics and discovery documents
//!
//! Everything the bridge publishes is retained, so a consumer that reconnects
//! picks up the last known value. State topics live under `ocpp/`, Home
//! Assistant discovery documents under `homeassistant/`.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::debug;

/// Prefix of state and command topics
pub const STATE_PREFIX: &str = "ocpp";

/// Prefix of discovery documents
pub const DISCOVERY_PREFIX: &str = "homeassistant";

const MANUFACTURER: &str = "OCPP Charger";

/// Meter channels forced to zero whenever energy stops flowing
pub const ZERO_CHANNELS: [&str; 8] = [
    "voltage_l1_outlet",
    "voltage_l2_outlet",
    "voltage_l3_outlet",
    "current_import_l1_outlet",
    "current_import_l2_outlet",
    "current_import_l3_outlet",
    "power_active_import_outlet",
    "current_offered_outlet",
];

/// Outbound side of the command-and-telemetry bus
pub trait TelemetrySink: Send + Sync {
    /// Retained, fire-and-forget publish
    fn publish(&self, topic: &str, payload: &str);

    /// Subscribe to the command topics of one charge point
    fn subscribe_controls(&self, identity: &str);
}

/// Controls exposed per charge point on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Suspend,
    Resume,
    UnlockCable,
    Availability,
    CurrentLimit,
}

impl Control {
    pub const ALL: [Control; 5] = [
        Control::Suspend,
        Control::Resume,
        Control::UnlockCable,
        Control::Availability,
        Control::CurrentLimit,
    ];

    /// Topic stem, e.g. `current_limit`
    pub fn stem(&self) -> &'static str {
        match self {
            Control::Suspend => "suspend",
            Control::Resume => "resume",
            Control::UnlockCable => "unlock_cable",
            Control::Availability => "availability",
            Control::CurrentLimit => "current_limit",
        }
    }

    /// Command topic leaf: buttons are pressed, everything else is set
    pub fn verb(&self) -> &'static str {
        match self {
            Control::UnlockCable => "press",
            _ => "set",
        }
    }

    /// Command topic relative to the state prefix, e.g. `suspend_CP1/set`
    pub fn command_suffix(&self, identity: &str) -> String {
        format!("{}_{}/{}", self.stem(), identity, self.verb())
    }

    /// Full command topic, e.g. `ocpp/suspend_CP1/set`
    pub fn command_topic(&self, identity: &str) -> String {
        format!("{}/{}", STATE_PREFIX, self.command_suffix(identity))
    }

    /// Full state topic, e.g. `ocpp/suspend_CP1/state`
    pub fn state_topic(&self, identity: &str) -> String {
        format!("{}/{}_{}/state", STATE_PREFIX, self.stem(), identity)
    }
}

/// Build a meter channel name from a sample's measurand, phase and location:
/// `<measurand>[_<phase>][_<location>]`, lowercased, dots and spaces as `_`.
pub fn meter_channel(measurand: Option<&str>, phase: Option<&str>, location: Option<&str>) -> String {
    let mut name = measurand
        .unwrap_or("unknown")
        .to_lowercase()
        .replace(['.', ' '], "_");
    if let Some(phase) = phase.filter(|p| !p.is_empty()) {
        name.push('_');
        name.push_str(&phase.to_lowercase());
    }
    if let Some(location) = location.filter(|l| !l.is_empty()) {
        name.push('_');
        name.push_str(&location.to_lowercase());
    }
    name.replace(' ', "_")
}

fn device_class(measurand: &str) -> Option<&'static str> {
    match measurand {
        "voltage" => Some("voltage"),
        "current_import" | "current_offered" => Some("current"),
        "power_active_import" => Some("power"),
        "energy_active_import_register" => Some("energy"),
        "frequency" => Some("frequency"),
        "temperature" => Some("temperature"),
        "soc" => Some("battery"),
        _ => None,
    }
}

fn state_class(measurand: &str) -> Option<&'static str> {
    if measurand.contains("energy") {
        Some("total_increasing")
    } else if measurand.contains("power") || measurand.contains("voltage") || measurand.contains("current") {
        Some("measurement")
    } else {
        None
    }
}

/// Per-charge-point publisher over a [`TelemetrySink`]
#[derive(Clone)]
pub struct Telemetry {
    identity: String,
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(identity: impl Into<String>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            identity: identity.into(),
            sink,
        }
    }

    fn device(&self) -> Value {
        json!({
            "identifiers": [self.identity],
            "name": self.identity,
            "manufacturer": MANUFACTURER,
        })
    }

    fn publish_json(&self, topic: &str, doc: &Value) {
        self.sink.publish(topic, &doc.to_string());
    }

    fn sensor_config_topic(&self, unique_id: &str) -> String {
        format!("{}/sensor/{}/config", DISCOVERY_PREFIX, unique_id)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status_{}", STATE_PREFIX, self.identity)
    }

    pub fn heartbeat_topic(&self) -> String {
        format!("{}/heartbeat_{}", STATE_PREFIX, self.identity)
    }

    pub fn last_charging_start_topic(&self) -> String {
        format!("{}/last_charging_start_{}", STATE_PREFIX, self.identity)
    }

    pub fn meter_topic(&self, channel: &str) -> String {
        format!("{}/meter_{}_{}", STATE_PREFIX, self.identity, channel)
    }

    /// Status sensor discovery plus the status value
    pub fn publish_status(&self, status: &str) {
        let unique_id = format!("{}_status", self.identity);
        let state_topic = self.status_topic();
        self.publish_json(
            &self.sensor_config_topic(&unique_id),
            &json!({
                "name": format!("{} Status", self.identity),
                "state_topic": state_topic,
                "unique_id": unique_id,
                "device": self.device(),
                "icon": "mdi:ev-station",
                "force_update": true,
            }),
        );
        self.sink.publish(&state_topic, status);
        debug!("{}: published status {}", self.identity, status);
    }

    /// Heartbeat sensor discovery plus the heartbeat timestamp
    pub fn publish_heartbeat(&self, at: DateTime<Utc>) {
        let unique_id = format!("{}_heartbeat", self.identity);
        let state_topic = self.heartbeat_topic();
        self.publish_json(
            &self.sensor_config_topic(&unique_id),
            &json!({
                "name": format!("{} Heartbeat", self.identity),
                "state_topic": state_topic,
                "unique_id": unique_id,
                "device": self.device(),
                "icon": "mdi:heart-pulse",
                "force_update": true,
            }),
        );
        self.sink.publish(&state_topic, &at.to_rfc3339_opts(SecondsFormat::Micros, true));
    }

    /// Last-charging-start sensor discovery, plus its value when known
    pub fn publish_last_charging_start_sensor(&self, last_start: Option<DateTime<Utc>>) {
        let unique_id = format!("{}_last_charging_start", self.identity);
        self.publish_json(
            &self.sensor_config_topic(&unique_id),
            &json!({
                "name": format!("{} Last Charging Start", self.identity),
                "state_topic": self.last_charging_start_topic(),
                "unique_id": unique_id,
                "device": self.device(),
                "icon": "mdi:clock-start",
                "device_class": "timestamp",
            }),
        );
        if let Some(at) = last_start {
            self.publish_last_charging_start(at);
        }
    }

    pub fn publish_last_charging_start(&self, at: DateTime<Utc>) {
        self.sink.publish(
            &self.last_charging_start_topic(),
            &at.to_rfc3339_opts(SecondsFormat::Micros, false),
        );
    }

    /// Meter sensor discovery plus the raw sample value
    pub fn publish_meter(&self, measurand: &str, channel: &str, unit: &str, value: &str) {
        let unique_id = format!("{}_{}", self.identity, channel);
        let state_topic = self.meter_topic(channel);
        self.publish_json(
            &self.sensor_config_topic(&unique_id),
            &json!({
                "name": format!("{} {}", self.identity, channel),
                "state_topic": state_topic,
                "unique_id": unique_id,
                "device": self.device(),
                "unit_of_measurement": unit,
                "device_class": device_class(measurand),
                "state_class": state_class(measurand),
                "force_update": true,
            }),
        );
        self.sink.publish(&state_topic, value);
        debug!("{}: published {}={} to {}", self.identity, channel, value, state_topic);
    }

    /// Publish `0` to each of the [`ZERO_CHANNELS`]
    pub fn zero_metrics(&self) {
        for channel in ZERO_CHANNELS {
            self.sink.publish(&self.meter_topic(channel), "0");
        }
    }

    pub fn publish_current_limit(&self, amps: i32) {
        self.sink
            .publish(&Control::CurrentLimit.state_topic(&self.identity), &amps.to_string());
    }

    pub fn publish_availability(&self, operative: bool) {
        self.sink.publish(
            &Control::Availability.state_topic(&self.identity),
            if operative { "ON" } else { "OFF" },
        );
    }

    pub fn publish_suspended(&self, suspended: bool) {
        self.sink.publish(
            &Control::Suspend.state_topic(&self.identity),
            if suspended { "ON" } else { "OFF" },
        );
    }

    /// Discovery documents for the control entities, with their initial states
    pub fn publish_control_discovery(&self, current_limit: i32, min_current: i32, max_current: i32) {
        let id = &self.identity;

        self.publish_json(
            &format!("{}/switch/availability_{}/config", DISCOVERY_PREFIX, id),
            &json!({
                "name": format!("{} Availability", id),
                "command_topic": Control::Availability.command_topic(id),
                "state_topic": Control::Availability.state_topic(id),
                "unique_id": format!("availability_{}", id),
                "device": self.device(),
                "icon": "mdi:power-settings",
            }),
        );
        self.publish_availability(true);

        self.publish_json(
            &format!("{}/switch/suspend_{}/config", DISCOVERY_PREFIX, id),
            &json!({
                "name": format!("{} Suspend Charging", id),
                "command_topic": Control::Suspend.command_topic(id),
                "state_topic": Control::Suspend.state_topic(id),
                "unique_id": format!("suspend_{}", id),
                "device": self.device(),
                "icon": "mdi:power",
            }),
        );
        self.publish_suspended(false);

        self.publish_json(
            &format!("{}/button/unlock_cable_{}/config", DISCOVERY_PREFIX, id),
            &json!({
                "name": format!("{} Unlock Cable", id),
                "command_topic": Control::UnlockCable.command_topic(id),
                "unique_id": format!("unlock_cable_{}", id),
                "device": self.device(),
                "icon": "mdi:lock-open",
            }),
        );

        self.publish_json(
            &format!("{}/number/current_limit_{}/config", DISCOVERY_PREFIX, id),
            &json!({
                "name": format!("{} Set Current Limit", id),
                "command_topic": Control::CurrentLimit.command_topic(id),
                "state_topic": Control::CurrentLimit.state_topic(id),
                "unique_id": format!("current_limit_{}", id),
                "device": self.device(),
                "min": min_current,
                "max": max_current,
                "step": 1,
                "mode": "box",
                "unit_of_measurement": "A",
                "icon": "mdi:current-ac",
            }),
        );
        self.publish_current_limit(current_limit);
    }
}
