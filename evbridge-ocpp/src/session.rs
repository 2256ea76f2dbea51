//! Charge point session state machine
//!
//! One [`ChargePointSession`] per connected charge point. The session is owned
//! by a single actor task ([`ChargePointSession::spawn`]) that drains a
//! mailbox of inbound protocol calls, bus commands and settle-timer expiries,
//! so its fields are only ever touched from that task. Outbound calls are
//! awaited inline, which keeps at most one call in flight per session.
//!
//! Status is adopted verbatim from the charge point; the machine reacts to
//! specific statuses but never rejects a transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::ocpp::*;
use crate::persistence::TransactionStore;
use crate::schedule::{self, LimitAdjustment, MAX_CURRENT_CHARGER};
use crate::telemetry::{self, Telemetry, TelemetrySink};

/// Profile id used for every profile the bridge installs
pub const CHARGING_PROFILE_ID: i32 = 1;

/// Stack level high enough to override station default profiles
pub const CHARGING_PROFILE_STACK_LEVEL: i32 = 1000;

/// Connector targeted by profiles and unlock requests
const CONNECTOR_ID: i32 = 1;

/// Connector id addressing the whole charge point
const WHOLE_CHARGE_POINT: i32 = 0;

/// Inbound actions with a handler. Anything else is answered as unsupported.
const INBOUND_ACTIONS: [Action; 6] = [
    Action::BootNotification,
    Action::Heartbeat,
    Action::StartTransaction,
    Action::StopTransaction,
    Action::MeterValues,
    Action::StatusNotification,
];

/// Look up the handler for an inbound action name
pub fn inbound_action(name: &str) -> Option<Action> {
    INBOUND_ACTIONS.iter().copied().find(|a| a.as_str() == name)
}

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Per-session settings captured once at construction
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Lowest current the vehicle can regulate to
    pub min_current_ev: i32,
    /// Physical ceiling of the charger
    pub max_current_charger: i32,
    /// Operating limit until the first SetCurrentLimit
    pub default_current: i32,
    /// Pause between StartTransaction and the first profile
    pub settle_delay: Duration,
    /// Heartbeat interval returned in the boot acknowledgment (seconds)
    pub heartbeat_interval: i32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_current_ev: 6,
            max_current_charger: MAX_CURRENT_CHARGER,
            default_current: 16,
            settle_delay: Duration::from_secs(5),
            heartbeat_interval: 30,
        }
    }
}

/// Operations a bus command can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Suspend,
    Resume,
    UnlockCable,
    ChangeAvailability(AvailabilityType),
    SetCurrentLimit(i32),
    RemoteStop { override_check: bool },
}

/// Reply to an inbound call: the CALLRESULT payload or the failure
pub type CallReply = Result<Value, SessionError>;

/// Unit of work for the session actor
#[derive(Debug)]
pub enum SessionMessage {
    /// CALL received from the charge point
    Inbound {
        call: Call,
        reply: oneshot::Sender<CallReply>,
    },
    /// Command from the bus
    Command(Command),
    /// Settle delay after StartTransaction expired
    SettleElapsed { generation: u64 },
}

/// Thread-safe handle to a running session actor
#[derive(Debug, Clone)]
pub struct SessionHandle {
    identity: String,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Post a command into the session. Never blocks, callable from any thread.
    pub fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(SessionMessage::Command(command))
            .map_err(|_| SessionError::SessionClosed(self.identity.clone()))
    }

    /// Queue an inbound CALL; the receiver resolves once the session handled it
    pub fn deliver(&self, call: Call) -> Result<oneshot::Receiver<CallReply>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Inbound { call, reply })
            .map_err(|_| SessionError::SessionClosed(self.identity.clone()))?;
        Ok(rx)
    }

    /// Deliver an inbound CALL and wait for the result
    pub async fn handle_call(&self, call: Call) -> CallReply {
        self.deliver(call)?
            .await
            .map_err(|_| SessionError::SessionClosed(self.identity.clone()))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles address the same actor
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Pending settle task, cancelled when a profile is sent for another reason
#[derive(Debug)]
struct PendingSettle {
    generation: u64,
    task: JoinHandle<()>,
}

/// One charge point's session state
pub struct ChargePointSession {
    identity: String,
    status: ChargePointStatus,
    current_transaction_id: Option<i64>,
    min_current_ev: i32,
    max_current_charger: i32,
    max_current_now: i32,
    last_charging_start: Option<DateTime<Utc>>,

    settings: SessionSettings,
    sender: Arc<dyn OcppSender>,
    telemetry: Telemetry,
    store: TransactionStore,
    clock: Arc<dyn Clock>,

    mailbox: Option<mpsc::WeakUnboundedSender<SessionMessage>>,
    settle_generation: u64,
    pending_settle: Option<PendingSettle>,
}

impl ChargePointSession {
    pub fn new(
        identity: impl Into<String>,
        settings: SessionSettings,
        sender: Arc<dyn OcppSender>,
        sink: Arc<dyn TelemetrySink>,
        store: TransactionStore,
    ) -> Self {
        let identity = identity.into();
        Self {
            telemetry: Telemetry::new(identity.clone(), sink),
            identity,
            status: ChargePointStatus::Init,
            current_transaction_id: None,
            min_current_ev: settings.min_current_ev,
            max_current_charger: settings.max_current_charger,
            max_current_now: settings.default_current,
            last_charging_start: None,
            settings,
            sender,
            store,
            clock: Arc::new(SystemClock),
            mailbox: None,
            settle_generation: 0,
            pending_settle: None,
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> &ChargePointStatus {
        &self.status
    }

    pub fn current_transaction_id(&self) -> Option<i64> {
        self.current_transaction_id
    }

    pub fn max_current_now(&self) -> i32 {
        self.max_current_now
    }

    pub fn last_charging_start(&self) -> Option<DateTime<Utc>> {
        self.last_charging_start
    }

    /// Whether a settle task is waiting to apply the default profile
    pub fn settle_pending(&self) -> bool {
        self.pending_settle.is_some()
    }

    /// Publish discovery documents and initial control states
    pub fn announce(&self) {
        self.telemetry.publish_control_discovery(
            self.max_current_now,
            self.min_current_ev,
            self.max_current_charger,
        );
        self.telemetry
            .publish_last_charging_start_sensor(self.last_charging_start);
    }

    /// Start the actor task owning this session
    pub fn spawn(mut self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailbox = Some(tx.downgrade());
        let handle = SessionHandle {
            identity: self.identity.clone(),
            tx,
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        debug!("{}: session actor started", self.identity);

        while let Some(message) = rx.recv().await {
            match message {
                SessionMessage::Inbound { call, reply } => {
                    let result = self.handle_call(&call).await;
                    if let Err(e) = &result {
                        error!("{}: failed to handle {}: {}", self.identity, call.action, e);
                    }
                    let _ = reply.send(result);
                }
                SessionMessage::Command(command) => {
                    if let Err(e) = self.execute(command).await {
                        error!("{}: command {:?} dropped: {}", self.identity, command, e);
                    }
                }
                SessionMessage::SettleElapsed { generation } => {
                    if let Err(e) = self.apply_settled_profile(generation).await {
                        error!("{}: settle profile failed: {}", self.identity, e);
                    }
                }
            }
        }

        self.cancel_pending_settle();
        debug!("{}: session actor stopped", self.identity);
    }

    // ------------------------------------------------------------------------
    // Inbound protocol events
    // ------------------------------------------------------------------------

    /// Dispatch an inbound CALL to its handler
    pub async fn handle_call(&mut self, call: &Call) -> CallReply {
        let action = match inbound_action(&call.action) {
            Some(action) => action,
            None => {
                warn!("{}: No handler registered for OCPP action: {}", self.identity, call.action);
                return Err(SessionError::UnsupportedAction(call.action.clone()));
            }
        };

        let response = match action {
            Action::BootNotification => {
                let req: BootNotificationRequest = parse(call)?;
                to_value(self.on_boot(&req.charge_point_vendor, &req.charge_point_model))?
            }
            Action::Heartbeat => to_value(self.on_heartbeat())?,
            Action::StartTransaction => {
                let req: StartTransactionRequest = parse(call)?;
                to_value(self.on_start_transaction(
                    req.connector_id,
                    &req.id_tag,
                    req.meter_start,
                    req.timestamp,
                ))?
            }
            Action::StopTransaction => {
                let req: StopTransactionRequest = parse(call)?;
                to_value(self.on_stop_transaction(req.transaction_id, req.meter_stop, req.timestamp))?
            }
            Action::MeterValues => {
                let req: MeterValuesRequest = parse(call)?;
                to_value(self.on_meter_values(req.connector_id, &req.meter_value))?
            }
            Action::StatusNotification => {
                let req: StatusNotificationRequest = parse(call)?;
                to_value(self.on_status_notification(req.connector_id, &req.status, &req.error_code))?
            }
            other => return Err(SessionError::UnsupportedAction(other.to_string())),
        };

        Ok(response)
    }

    pub fn on_boot(&mut self, vendor: &str, model: &str) -> BootNotificationResponse {
        info!(
            "{}: BootNotification received (vendor={}, model={})",
            self.identity, vendor, model
        );
        self.set_status(ChargePointStatus::Booted);

        BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: self.clock.now(),
            interval: self.settings.heartbeat_interval,
        }
    }

    pub fn on_heartbeat(&mut self) -> HeartbeatResponse {
        let now = self.clock.now();
        debug!("{}: Heartbeat received", self.identity);
        self.telemetry.publish_heartbeat(now);
        HeartbeatResponse { current_time: now }
    }

    pub fn on_start_transaction(
        &mut self,
        connector_id: i32,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
    ) -> StartTransactionResponse {
        info!(
            "{}: StartTransaction received: connector_id={}, id_tag={}, meter_start={}, timestamp={}",
            self.identity, connector_id, id_tag, meter_start, timestamp
        );

        // Seconds since epoch; two starts within one second collide, which a
        // single connector never does.
        let now = self.clock.now();
        let transaction_id = now.timestamp();
        self.current_transaction_id = Some(transaction_id);
        self.last_charging_start = Some(now);

        self.telemetry.publish_last_charging_start(now);
        self.persist_transaction_id();
        self.schedule_settle();

        info!("{}: StartTransaction accepted, transaction_id={}", self.identity, transaction_id);
        StartTransactionResponse {
            transaction_id,
            id_tag_info: IdTagInfo::accepted(),
        }
    }

    /// Persists the id but leaves it set: late meter reports after a stop
    /// still attribute to the last transaction.
    pub fn on_stop_transaction(
        &mut self,
        transaction_id: i64,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
    ) -> StopTransactionResponse {
        info!(
            "{}: StopTransaction received: transaction_id={}, meter_stop={}, timestamp={}",
            self.identity, transaction_id, meter_stop, timestamp
        );
        self.persist_transaction_id();

        StopTransactionResponse {
            id_tag_info: Some(IdTagInfo::accepted()),
        }
    }

    pub fn on_meter_values(&mut self, connector_id: i32, meter_values: &[MeterValue]) -> MeterValuesResponse {
        info!(
            "{}: MeterValues received: connector_id={}, {} reading(s)",
            self.identity,
            connector_id,
            meter_values.len()
        );

        // Meter data means energy is flowing; recover the id after a restart.
        if self.current_transaction_id.is_none() {
            self.current_transaction_id = self.store.load();
            if let Some(id) = self.current_transaction_id {
                info!("{}: recovered transaction id {} from storage", self.identity, id);
            }
        }
        self.status = ChargePointStatus::Charging;

        for sample in meter_values.iter().flat_map(|mv| mv.sampled_value.iter()) {
            let measurand = sample
                .measurand
                .as_deref()
                .unwrap_or("unknown")
                .to_lowercase()
                .replace(['.', ' '], "_");
            let channel = telemetry::meter_channel(
                sample.measurand.as_deref(),
                sample.phase.as_deref(),
                sample.location.as_deref(),
            );
            self.telemetry.publish_meter(
                &measurand,
                &channel,
                sample.unit.as_deref().unwrap_or(""),
                &sample.value,
            );
        }

        MeterValuesResponse {}
    }

    pub fn on_status_notification(
        &mut self,
        connector_id: i32,
        status: &str,
        error_code: &str,
    ) -> StatusNotificationResponse {
        info!(
            "{}: StatusNotification received: connector={}, status={}, error_code={}",
            self.identity, connector_id, status, error_code
        );

        let status: ChargePointStatus = status.parse().unwrap_or_else(|e| match e {});
        if status.zeroes_metrics() {
            self.zero_metrics();
        }
        self.set_status(status);

        StatusNotificationResponse {}
    }

    /// Publish zero to the fixed set of power-related meter channels
    pub fn zero_metrics(&self) {
        self.telemetry.zero_metrics();
        info!(
            "{}: Published 0 for {} meter channels",
            self.identity,
            telemetry::ZERO_CHANNELS.len()
        );
    }

    fn set_status(&mut self, status: ChargePointStatus) {
        self.telemetry.publish_status(&status.to_string());
        self.status = status;
    }

    fn persist_transaction_id(&self) {
        if let Err(e) = self.store.persist(self.current_transaction_id) {
            error!(
                "{}: failed to persist transaction id to {:?}: {}",
                self.identity,
                self.store.path(),
                e
            );
        }
    }

    // ------------------------------------------------------------------------
    // Settle delay
    // ------------------------------------------------------------------------

    /// Arm the settle timer, replacing any pending one
    fn schedule_settle(&mut self) {
        self.cancel_pending_settle();
        self.settle_generation += 1;
        let generation = self.settle_generation;

        let mailbox = self.mailbox.clone();
        let delay = self.settings.settle_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.and_then(|weak| weak.upgrade()) {
                let _ = tx.send(SessionMessage::SettleElapsed { generation });
            }
        });

        debug!("{}: settle timer armed ({:?}, generation {})", self.identity, delay, generation);
        self.pending_settle = Some(PendingSettle { generation, task });
    }

    fn cancel_pending_settle(&mut self) {
        if let Some(pending) = self.pending_settle.take() {
            pending.task.abort();
            debug!("{}: settle timer {} cancelled", self.identity, pending.generation);
        }
    }

    /// Apply the default profile once the settle delay has passed. Ignored if
    /// the timer was superseded in the meantime.
    pub async fn apply_settled_profile(&mut self, generation: u64) -> Result<(), SessionError> {
        match &self.pending_settle {
            Some(pending) if pending.generation == generation => {
                self.pending_settle = None;
            }
            _ => {
                debug!("{}: stale settle timer {} ignored", self.identity, generation);
                return Ok(());
            }
        }
        self.send_charging_profile(self.max_current_now).await
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Execute a bus command
    pub async fn execute(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Suspend => self.suspend().await,
            Command::Resume => self.resume().await,
            Command::UnlockCable => self.unlock_cable().await,
            Command::ChangeAvailability(kind) => self.change_availability(kind).await,
            Command::SetCurrentLimit(amps) => self.set_current_limit(amps).await,
            Command::RemoteStop { override_check } => self.request_remote_stop(override_check).await,
        }
    }

    /// Store the new operating limit; re-send the profile if charging.
    ///
    /// No bounds check here: an out-of-range value is stored as given and is
    /// only clamped when a schedule is built.
    pub async fn set_current_limit(&mut self, amps: i32) -> Result<(), SessionError> {
        info!("{}: Setting current limit to {}A", self.identity, amps);
        self.max_current_now = amps;

        if self.status == ChargePointStatus::Charging {
            self.set_charging_profile(self.max_current_now).await?;
        }

        self.telemetry.publish_current_limit(amps);
        Ok(())
    }

    pub async fn suspend(&mut self) -> Result<(), SessionError> {
        info!("{}: Suspending charging", self.identity);
        self.set_charging_profile(0).await?;
        self.telemetry.publish_suspended(true);
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), SessionError> {
        info!("{}: Resuming charging", self.identity);
        self.set_charging_profile(self.max_current_now).await?;
        self.telemetry.publish_suspended(false);
        Ok(())
    }

    /// Ask the charge point to stop the current transaction.
    ///
    /// Sent only while a transaction can be running and its id is known,
    /// unless `override_check` is set.
    pub async fn request_remote_stop(&mut self, override_check: bool) -> Result<(), SessionError> {
        let stoppable = matches!(
            self.status,
            ChargePointStatus::Charging | ChargePointStatus::SuspendedEV | ChargePointStatus::Init
        );

        if !(override_check || (stoppable && self.current_transaction_id.is_some())) {
            info!(
                "{}: RemoteStopTransaction skipped (status={}, current_transaction_id={:?})",
                self.identity, self.status, self.current_transaction_id
            );
            return Ok(());
        }

        info!(
            "{}: Sending RemoteStopTransaction (transactionId={:?})",
            self.identity, self.current_transaction_id
        );
        self.send_call(
            Action::RemoteStopTransaction,
            RemoteStopTransactionRequest {
                transaction_id: self.current_transaction_id,
            },
        )
        .await?;
        Ok(())
    }

    /// Unlock the connector. Refused while the vehicle is drawing power.
    pub async fn unlock_cable(&mut self) -> Result<(), SessionError> {
        if self.status.is_drawing_power() {
            warn!("{}: Unlock cable refused while {}", self.identity, self.status);
            return Ok(());
        }

        info!("{}: Unlocking cable (sending OCPP UnlockConnector command)", self.identity);
        self.send_call(
            Action::UnlockConnector,
            UnlockConnectorRequest {
                connector_id: CONNECTOR_ID,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn change_availability(&mut self, kind: AvailabilityType) -> Result<(), SessionError> {
        info!("{}: Changing availability to {}", self.identity, kind);
        if let Some(result) = self
            .send_call(
                Action::ChangeAvailability,
                ChangeAvailabilityRequest {
                    connector_id: WHOLE_CHARGE_POINT,
                    availability: kind,
                },
            )
            .await?
        {
            log_status_response(&self.identity, Action::ChangeAvailability, &result);
        }

        self.telemetry
            .publish_availability(kind == AvailabilityType::Operative);
        Ok(())
    }

    /// Send a profile for `limit_amps`. Any pending settle timer is superseded.
    pub async fn set_charging_profile(&mut self, limit_amps: i32) -> Result<(), SessionError> {
        self.cancel_pending_settle();
        self.send_charging_profile(limit_amps).await
    }

    async fn send_charging_profile(&mut self, limit_amps: i32) -> Result<(), SessionError> {
        info!(
            "{}: Setting charging profile (sending OCPP SetChargingProfile command)",
            self.identity
        );

        // Fallback never exceeds what the charger can deliver, even if a
        // larger operating limit was stored.
        let fallback = self.max_current_now.clamp(0, self.max_current_charger);
        let built = schedule::build_schedule(
            limit_amps,
            self.min_current_ev,
            self.max_current_charger,
            fallback,
        );
        match built.adjustment {
            LimitAdjustment::InvalidFallback => error!(
                "{}: Invalid current limit {}, must be between 0 and {}; using {}",
                self.identity, limit_amps, self.max_current_charger, fallback
            ),
            LimitAdjustment::RaisedToMinimum => info!(
                "{}: Current limit {} below EV minimum, raised to {}",
                self.identity, limit_amps, self.min_current_ev
            ),
            LimitAdjustment::Unchanged => {}
        }

        let request = SetChargingProfileRequest {
            connector_id: CONNECTOR_ID,
            cs_charging_profiles: ChargingProfile {
                charging_profile_id: CHARGING_PROFILE_ID,
                stack_level: CHARGING_PROFILE_STACK_LEVEL,
                charging_profile_purpose: ChargingProfilePurpose::TxProfile,
                charging_profile_kind: ChargingProfileKind::Absolute,
                charging_schedule: ChargingSchedule {
                    charging_rate_unit: ChargingRateUnit::A,
                    charging_schedule_period: built.to_periods(),
                    start_schedule: Some(self.clock.now().trunc_subsecs(0)),
                    duration: None,
                    min_charging_rate: None,
                },
                transaction_id: None,
                valid_from: None,
                valid_to: None,
            },
        };

        if let Some(result) = self.send_call(Action::SetChargingProfile, request).await? {
            log_status_response(&self.identity, Action::SetChargingProfile, &result);
        }
        Ok(())
    }

    /// Issue an outbound call. Transport and remote failures are logged and
    /// yield `None`; only a payload that cannot be built is an error.
    async fn send_call(
        &self,
        action: Action,
        payload: impl Serialize,
    ) -> Result<Option<CallResult>, SessionError> {
        let call = Call::new(action, payload)?;
        match self.sender.call(call).await {
            Ok(result) => {
                info!("{}: {} response: {}", self.identity, action, result.payload);
                Ok(Some(result))
            }
            Err(OcppError::RemoteError { code, description, .. }) => {
                error!("{}: {} error: {:?} {}", self.identity, action, code, description);
                Ok(None)
            }
            Err(e) => {
                error!("{}: {} failed: {}", self.identity, action, e);
                Ok(None)
            }
        }
    }
}

fn log_status_response(identity: &str, action: Action, result: &CallResult) {
    match result.parse_payload::<StatusResponse>() {
        Ok(resp) if resp.status == "Accepted" => {}
        Ok(resp) => warn!("{}: {} not accepted: {}", identity, action, resp.status),
        Err(e) => warn!("{}: unexpected {} response: {}", identity, action, e),
    }
}

fn parse<T: for<'de> serde::Deserialize<'de>>(call: &Call) -> Result<T, SessionError> {
    serde_json::from_value(call.payload.clone()).map_err(|source| SessionError::InvalidPayload {
        action: call.action.clone(),
        source,
    })
}

fn to_value(response: impl Serialize) -> Result<Value, SessionError> {
    serde_json::to_value(response).map_err(|e| SessionError::Ocpp(e.into()))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::telemetry::testing::RecordingSink;

    /// Answers every call with `{"status": "Accepted"}` and records it
    #[derive(Default)]
    pub struct RecordingSender {
        pub calls: Mutex<Vec<Call>>,
        pub reject_with: Mutex<Option<ErrorCode>>,
    }

    impl RecordingSender {
        pub fn actions(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.action.clone()).collect()
        }

        /// Period limits of every SetChargingProfile sent
        pub fn profile_limits(&self) -> Vec<(f64, f64)> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.action == "SetChargingProfile")
                .map(|c| {
                    let req: SetChargingProfileRequest = c.parse_payload().unwrap();
                    let periods = req.cs_charging_profiles.charging_schedule.charging_schedule_period;
                    (periods[0].limit, periods[1].limit)
                })
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl OcppSender for RecordingSender {
        async fn call(&self, call: Call) -> Result<CallResult, OcppError> {
            self.calls.lock().push(call.clone());
            if let Some(code) = *self.reject_with.lock() {
                return Err(OcppError::RemoteError {
                    code,
                    description: "rejected".into(),
                    details: json!({}),
                });
            }
            Ok(CallResult {
                message_id: call.message_id,
                payload: json!({"status": "Accepted"}),
            })
        }
    }

    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    pub fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:15:30.250Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub fn test_session(
        dir: &Path,
    ) -> (ChargePointSession, Arc<RecordingSender>, Arc<RecordingSink>) {
        let sender = Arc::new(RecordingSender::default());
        let sink = Arc::new(RecordingSink::default());
        let session = ChargePointSession::new(
            "CP1",
            SessionSettings::default(),
            sender.clone(),
            sink.clone(),
            TransactionStore::new(dir.join("persist.json")),
        )
        .with_clock(Arc::new(FixedClock(fixed_time())));
        (session, sender, sink)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::testing::*;
    use super::*;

    fn sample(measurand: &str, phase: Option<&str>, value: &str) -> SampledValue {
        SampledValue {
            value: value.to_string(),
            context: None,
            format: None,
            measurand: Some(measurand.to_string()),
            phase: phase.map(str::to_string),
            location: Some("Outlet".to_string()),
            unit: Some("V".to_string()),
        }
    }

    #[test]
    fn test_dispatch_table() {
        assert_eq!(inbound_action("BootNotification"), Some(Action::BootNotification));
        assert_eq!(inbound_action("MeterValues"), Some(Action::MeterValues));
        assert_eq!(inbound_action("SetChargingProfile"), None);
        assert_eq!(inbound_action("DataTransfer"), None);
    }

    #[tokio::test]
    async fn test_unsupported_action_is_typed_error() {
        let dir = tempdir().unwrap();
        let (mut session, _, _) = test_session(dir.path());

        let call = Call {
            message_id: "m1".into(),
            action: "DataTransfer".into(),
            payload: json!({}),
        };
        let err = session.handle_call(&call).await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedAction(a) if a == "DataTransfer"));
    }

    #[tokio::test]
    async fn test_invalid_payload_propagates() {
        let dir = tempdir().unwrap();
        let (mut session, _, _) = test_session(dir.path());

        let call = Call {
            message_id: "m1".into(),
            action: "StartTransaction".into(),
            payload: json!({"connectorId": "one"}),
        };
        let err = session.handle_call(&call).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload { .. }));
        assert_eq!(session.current_transaction_id(), None);
    }

    #[tokio::test]
    async fn test_boot_publishes_status() {
        let dir = tempdir().unwrap();
        let (mut session, _, sink) = test_session(dir.path());

        let call = Call {
            message_id: "m1".into(),
            action: "BootNotification".into(),
            payload: json!({"chargePointVendor": "Acme", "chargePointModel": "Wallbox"}),
        };
        let response = session.handle_call(&call).await.unwrap();

        assert_eq!(response["status"], "Accepted");
        assert_eq!(response["interval"], 30);
        assert_eq!(session.status(), &ChargePointStatus::Booted);
        assert_eq!(sink.last_value("ocpp/status_CP1").as_deref(), Some("Booted"));
    }

    #[tokio::test]
    async fn test_start_transaction_assigns_and_persists_id() {
        let dir = tempdir().unwrap();
        let (mut session, sender, sink) = test_session(dir.path());

        let response = session.on_start_transaction(1, "X", 0, fixed_time());

        let expected = fixed_time().timestamp();
        assert_eq!(response.transaction_id, expected);
        assert_eq!(response.id_tag_info.status, AuthorizationStatus::Accepted);
        assert_eq!(session.current_transaction_id(), Some(expected));
        assert_eq!(TransactionStore::new(dir.path().join("persist.json")).load(), Some(expected));
        assert!(sink.last_value("ocpp/last_charging_start_CP1").is_some());
        assert!(session.settle_pending());
        // Nothing sent before the settle delay
        assert!(sender.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_transaction_keeps_id() {
        let dir = tempdir().unwrap();
        let (mut session, _, _) = test_session(dir.path());

        let started = session.on_start_transaction(1, "X", 0, fixed_time()).transaction_id;
        session.on_stop_transaction(started, 1500, fixed_time());

        assert_eq!(session.current_transaction_id(), Some(started));
        assert_eq!(TransactionStore::new(dir.path().join("persist.json")).load(), Some(started));
    }

    #[tokio::test]
    async fn test_meter_values_recover_persisted_id() {
        let dir = tempdir().unwrap();
        TransactionStore::new(dir.path().join("persist.json"))
            .persist(Some(42))
            .unwrap();
        let (mut session, _, sink) = test_session(dir.path());

        let readings = vec![MeterValue {
            timestamp: fixed_time(),
            sampled_value: vec![
                sample("Voltage", Some("L1"), "231.0"),
                sample("Current.Import", Some("L1"), "15.9"),
            ],
        }];
        session.on_meter_values(1, &readings);

        assert_eq!(session.current_transaction_id(), Some(42));
        assert_eq!(session.status(), &ChargePointStatus::Charging);
        assert_eq!(sink.last_value("ocpp/meter_CP1_voltage_l1_outlet").as_deref(), Some("231.0"));
        assert_eq!(
            sink.last_value("ocpp/meter_CP1_current_import_l1_outlet").as_deref(),
            Some("15.9")
        );
    }

    #[tokio::test]
    async fn test_suspended_status_zeroes_then_publishes() {
        let dir = tempdir().unwrap();
        let (mut session, _, sink) = test_session(dir.path());

        session.on_status_notification(1, "SuspendedEV", "NoError");

        let states = sink.states();
        assert_eq!(states.len(), 9);
        assert!(states[..8].iter().all(|(t, v)| t.starts_with("ocpp/meter_CP1_") && v == "0"));
        assert_eq!(states[8], ("ocpp/status_CP1".to_string(), "SuspendedEV".to_string()));
        assert_eq!(session.status(), &ChargePointStatus::SuspendedEV);
    }

    #[tokio::test]
    async fn test_charging_status_does_not_zero() {
        let dir = tempdir().unwrap();
        let (mut session, _, sink) = test_session(dir.path());

        session.on_status_notification(1, "Charging", "NoError");

        assert_eq!(sink.states(), vec![("ocpp/status_CP1".to_string(), "Charging".to_string())]);
    }

    #[tokio::test]
    async fn test_set_current_limit_while_idle_only_publishes() {
        let dir = tempdir().unwrap();
        let (mut session, sender, sink) = test_session(dir.path());

        session.set_current_limit(10).await.unwrap();

        assert_eq!(session.max_current_now(), 10);
        assert!(sender.calls.lock().is_empty());
        assert_eq!(sink.last_value("ocpp/current_limit_CP1/state").as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_set_current_limit_while_charging_sends_profile() {
        let dir = tempdir().unwrap();
        let (mut session, sender, _) = test_session(dir.path());
        session.on_status_notification(1, "Charging", "NoError");

        session.set_current_limit(20).await.unwrap();

        assert_eq!(sender.profile_limits(), vec![(20.0, 20.0)]);
    }

    #[tokio::test]
    async fn test_out_of_range_limit_stored_but_clamped() {
        let dir = tempdir().unwrap();
        let (mut session, sender, sink) = test_session(dir.path());
        session.on_status_notification(1, "Charging", "NoError");

        session.set_current_limit(40).await.unwrap();

        assert_eq!(session.max_current_now(), 40);
        assert_eq!(sender.profile_limits(), vec![(32.0, 32.0)]);
        assert_eq!(sink.last_value("ocpp/current_limit_CP1/state").as_deref(), Some("40"));
    }

    #[tokio::test]
    async fn test_suspend_and_resume_profiles() {
        let dir = tempdir().unwrap();
        let (mut session, sender, sink) = test_session(dir.path());

        session.suspend().await.unwrap();
        assert_eq!(sink.last_value("ocpp/suspend_CP1/state").as_deref(), Some("ON"));
        session.resume().await.unwrap();
        assert_eq!(sink.last_value("ocpp/suspend_CP1/state").as_deref(), Some("OFF"));

        assert_eq!(sender.profile_limits(), vec![(0.0, 16.0), (16.0, 16.0)]);

        let profile: SetChargingProfileRequest = sender.calls.lock()[0].parse_payload().unwrap();
        assert_eq!(profile.connector_id, 1);
        let p = profile.cs_charging_profiles;
        assert_eq!(p.charging_profile_id, 1);
        assert_eq!(p.stack_level, 1000);
        assert_eq!(p.charging_profile_purpose, ChargingProfilePurpose::TxProfile);
        assert_eq!(p.charging_profile_kind, ChargingProfileKind::Absolute);
        assert_eq!(
            p.charging_schedule.start_schedule,
            Some(fixed_time().trunc_subsecs(0))
        );
    }

    #[tokio::test]
    async fn test_remote_stop_guard() {
        let dir = tempdir().unwrap();
        let (mut session, sender, _) = test_session(dir.path());

        // Init without a transaction id: skipped
        session.request_remote_stop(false).await.unwrap();
        assert!(sender.calls.lock().is_empty());

        // Override always sends
        session.request_remote_stop(true).await.unwrap();
        assert_eq!(sender.actions(), vec!["RemoteStopTransaction"]);

        // Init with an id: sent
        let id = session.on_start_transaction(1, "X", 0, fixed_time()).transaction_id;
        assert_eq!(session.status(), &ChargePointStatus::Init);
        session.request_remote_stop(false).await.unwrap();
        assert_eq!(sender.calls.lock().len(), 2);

        // Charging and SuspendedEV with an id: sent
        for status in ["Charging", "SuspendedEV"] {
            session.on_status_notification(1, status, "NoError");
            session.request_remote_stop(false).await.unwrap();
        }
        assert_eq!(sender.calls.lock().len(), 4);
        for call in sender.calls.lock().iter().skip(1) {
            let req: RemoteStopTransactionRequest = call.parse_payload().unwrap();
            assert_eq!(req.transaction_id, Some(id));
        }

        // Available or SuspendedEVSE with an id: skipped
        for status in ["Available", "SuspendedEVSE"] {
            session.on_status_notification(1, status, "NoError");
            session.request_remote_stop(false).await.unwrap();
        }
        assert_eq!(sender.calls.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_unlock_refused_while_charging() {
        let dir = tempdir().unwrap();
        let (mut session, sender, _) = test_session(dir.path());

        session.on_status_notification(1, "Charging", "NoError");
        session.unlock_cable().await.unwrap();
        session.on_status_notification(1, "SuspendedEV", "NoError");
        session.unlock_cable().await.unwrap();
        assert!(sender.calls.lock().is_empty());

        session.on_status_notification(1, "Finishing", "NoError");
        session.unlock_cable().await.unwrap();
        assert_eq!(sender.actions(), vec!["UnlockConnector"]);
    }

    #[tokio::test]
    async fn test_change_availability_error_is_logged_only() {
        let dir = tempdir().unwrap();
        let (mut session, sender, sink) = test_session(dir.path());
        *sender.reject_with.lock() = Some(ErrorCode::NotSupported);

        session
            .change_availability(AvailabilityType::Inoperative)
            .await
            .unwrap();

        let req: ChangeAvailabilityRequest = sender.calls.lock()[0].parse_payload().unwrap();
        assert_eq!(req.connector_id, 0);
        assert_eq!(req.availability, AvailabilityType::Inoperative);
        assert_eq!(sink.last_value("ocpp/availability_CP1/state").as_deref(), Some("OFF"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_applies_default_profile() {
        let dir = tempdir().unwrap();
        let (session, sender, _) = test_session(dir.path());
        let (handle, _task) = session.spawn();

        let call = Call::new(
            Action::StartTransaction,
            StartTransactionRequest {
                connector_id: 1,
                id_tag: "X".into(),
                meter_start: 0,
                timestamp: fixed_time(),
                reservation_id: None,
            },
        )
        .unwrap();
        let response = handle.handle_call(call).await.unwrap();
        assert_eq!(response["transactionId"], fixed_time().timestamp());
        assert_eq!(response["idTagInfo"]["status"], "Accepted");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(sender.calls.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sender.profile_limits(), vec![(16.0, 16.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_during_settle_window_wins() {
        let dir = tempdir().unwrap();
        let (session, sender, _) = test_session(dir.path());
        let (handle, _task) = session.spawn();

        let call = Call::new(
            Action::StartTransaction,
            StartTransactionRequest {
                connector_id: 1,
                id_tag: "X".into(),
                meter_start: 0,
                timestamp: fixed_time(),
                reservation_id: None,
            },
        )
        .unwrap();
        handle.handle_call(call).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.submit(Command::Suspend).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sender.profile_limits(), vec![(0.0, 16.0)]);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_session() {
        let dir = tempdir().unwrap();
        let (session, _, _) = test_session(dir.path());
        let (handle, task) = session.spawn();
        task.abort();
        let _ = task.await;

        assert!(handle.is_closed());
        assert!(matches!(
            handle.submit(Command::Resume),
            Err(SessionError::SessionClosed(_))
        ));
    }
}
