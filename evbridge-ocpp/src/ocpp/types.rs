//! OCPP 1.6 message types
//!
//! The subset of OCPP 1.6-J payloads the bridge exchanges with a charge point:
//! - BootNotification / Heartbeat / StatusNotification / MeterValues (CP -> CS)
//! - StartTransaction / StopTransaction (CP -> CS)
//! - SetChargingProfile / RemoteStopTransaction / UnlockConnector /
//!   ChangeAvailability (CS -> CP)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// Charge point status as tracked by the bridge.
///
/// `Init` and `Booted` are bridge-local; everything else comes from
/// StatusNotification. Unknown strings are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargePointStatus {
    Init,
    Booted,
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Inoperative,
    Other(String),
}

impl ChargePointStatus {
    /// Statuses in which no energy flows and meter telemetry must be zeroed
    pub fn zeroes_metrics(&self) -> bool {
        matches!(
            self,
            ChargePointStatus::SuspendedEV
                | ChargePointStatus::SuspendedEVSE
                | ChargePointStatus::Inoperative
                | ChargePointStatus::Finishing
                | ChargePointStatus::Available
        )
    }

    /// Statuses during which the cable must stay locked
    pub fn is_drawing_power(&self) -> bool {
        matches!(self, ChargePointStatus::Charging | ChargePointStatus::SuspendedEV)
    }
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargePointStatus::Other(s) => f.write_str(s),
            other => write!(f, "{:?}", other),
        }
    }
}

impl FromStr for ChargePointStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Init" => ChargePointStatus::Init,
            "Booted" => ChargePointStatus::Booted,
            "Available" => ChargePointStatus::Available,
            "Preparing" => ChargePointStatus::Preparing,
            "Charging" => ChargePointStatus::Charging,
            "SuspendedEV" => ChargePointStatus::SuspendedEV,
            "SuspendedEVSE" => ChargePointStatus::SuspendedEVSE,
            "Finishing" => ChargePointStatus::Finishing,
            "Reserved" => ChargePointStatus::Reserved,
            "Unavailable" => ChargePointStatus::Unavailable,
            "Faulted" => ChargePointStatus::Faulted,
            "Inoperative" => ChargePointStatus::Inoperative,
            other => ChargePointStatus::Other(other.to_string()),
        })
    }
}

/// Charging profile purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

/// Charging profile kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

/// Charging rate unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Authorization status carried in IdTagInfo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

/// Availability type for ChangeAvailability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AvailabilityType {
    Operative,
    Inoperative,
}

impl fmt::Display for AvailabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Complex Types
// ============================================================================

/// Authorization info returned for Start/StopTransaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

impl IdTagInfo {
    pub fn accepted() -> Self {
        Self {
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
            parent_id_tag: None,
        }
    }
}

/// Charging schedule period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

/// Charging schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

/// Charging profile (`csChargingProfiles`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    pub charging_schedule: ChargingSchedule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

/// Sampled value for meter readings. OCPP 1.6 carries the value as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Meter value with timestamp and samples
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

// ============================================================================
// Request Messages (CP -> CS)
// ============================================================================

/// BootNotification request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Heartbeat request (empty payload)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// StartTransaction request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: i32,
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
}

/// StopTransaction request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i64,
    pub meter_stop: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// MeterValues request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub meter_value: Vec<MeterValue>,
}

/// StatusNotification request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: i32,
    pub error_code: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// Request Messages (CS -> CP)
// ============================================================================

/// SetChargingProfile request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: i32,
    pub cs_charging_profiles: ChargingProfile,
}

/// RemoteStopTransaction request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: Option<i64>,
}

/// UnlockConnector request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: i32,
}

/// ChangeAvailability request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeAvailabilityRequest {
    pub connector_id: i32,
    #[serde(rename = "type")]
    pub availability: AvailabilityType,
}

// ============================================================================
// Response Messages
// ============================================================================

/// BootNotification response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    pub interval: i32,
}

/// Heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// StartTransaction response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub transaction_id: i64,
    pub id_tag_info: IdTagInfo,
}

/// StopTransaction response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

/// MeterValues response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

/// StatusNotification response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

/// Status-only response returned by the charge point for CS -> CP calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}
