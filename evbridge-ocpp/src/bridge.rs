//! Bus command routing
//!
//! [`CommandBridge::handle`] is called on the bus delivery thread for every
//! message on a command topic. It resolves the target session, applies the
//! write-access gate and posts a typed [`Command`] into the session's mailbox.
//! The post is a plain unbounded channel send: it never blocks and the bridge
//! never waits for the outcome.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::ocpp::AvailabilityType;
use crate::registry::SessionRegistry;
use crate::session::Command;
use crate::telemetry::{Control, STATE_PREFIX};

/// Split a command topic into its control and charge point identity.
///
/// Accepts the topic with or without the `ocpp/` prefix.
pub fn parse_topic(topic: &str) -> Option<(Control, &str)> {
    let suffix = topic
        .strip_prefix(STATE_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(topic);
    let (name, verb) = suffix.rsplit_once('/')?;

    Control::ALL.into_iter().find_map(|control| {
        let identity = name.strip_prefix(control.stem())?.strip_prefix('_')?;
        (verb == control.verb() && !identity.is_empty()).then_some((control, identity))
    })
}

/// Switch controls are on only for the exact payload `ON`
fn switch_on(payload: &str) -> bool {
    payload == "ON"
}

/// Turn a control's payload into the command it requests
pub fn parse_command(control: Control, payload: &str) -> Option<Command> {
    match control {
        Control::Suspend => Some(if switch_on(payload) {
            Command::Suspend
        } else {
            Command::Resume
        }),
        Control::Resume => Some(Command::Resume),
        Control::UnlockCable => Some(Command::UnlockCable),
        Control::Availability => Some(Command::ChangeAvailability(if switch_on(payload) {
            AvailabilityType::Operative
        } else {
            AvailabilityType::Inoperative
        })),
        Control::CurrentLimit => payload.trim().parse().ok().map(Command::SetCurrentLimit),
    }
}

/// Routes bus commands to registered sessions
#[derive(Debug, Clone)]
pub struct CommandBridge {
    registry: Arc<SessionRegistry>,
    write_access: bool,
}

impl CommandBridge {
    pub fn new(registry: Arc<SessionRegistry>, write_access: bool) -> Self {
        Self {
            registry,
            write_access,
        }
    }

    pub fn write_access(&self) -> bool {
        self.write_access
    }

    /// Handle one bus message. Failures are logged and the message dropped.
    pub fn handle(&self, topic: &str, payload: &str) {
        debug!("Command received: topic={}, payload={}", topic, payload);

        match self.route(topic, payload) {
            Ok((identity, command)) => {
                info!("{}: queued {:?}", identity, command);
            }
            Err(e @ CommandError::WriteAccessDisabled(_)) => info!("{}", e),
            Err(e) => warn!("Dropping command: {}", e),
        }
    }

    /// Resolve and post the command carried by `topic`/`payload`
    pub fn route(&self, topic: &str, payload: &str) -> Result<(String, Command), CommandError> {
        let (control, identity) =
            parse_topic(topic).ok_or_else(|| CommandError::UnknownTopic(topic.to_string()))?;

        let session = self
            .registry
            .lookup(identity)
            .ok_or_else(|| CommandError::UnknownSession(identity.to_string()))?;

        if !self.write_access {
            return Err(CommandError::WriteAccessDisabled(topic.to_string()));
        }

        let command = parse_command(control, payload).ok_or_else(|| CommandError::InvalidPayload {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })?;

        session
            .submit(command)
            .map_err(|_| CommandError::SessionClosed(identity.to_string()))?;

        Ok((identity.to_string(), command))
    }
}
