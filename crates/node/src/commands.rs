//! Command vocabulary, response decoding, and the `PATCH {base}/devices/control`
//! poller.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::connectivity::ConnectionState;
use crate::identity::DeviceIdentity;
use crate::telemetry::auth_headers;
use crate::transport::{Method, Request, Transport};

pub const CONTROL_PATH: &str = "/devices/control";

/// The only status that means "commands are in the body".
pub const COMMANDS_AVAILABLE: u16 = 200;

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Water,
    LightOn,
    LightOff,
    SetLightBrightness,
    GetStatus,
    /// Unrecognised wire name, kept for the log line.
    Unknown(String),
}

impl Action {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "water" => Self::Water,
            "light_on" => Self::LightOn,
            "light_off" => Self::LightOff,
            "set_light_brightness" => Self::SetLightBrightness,
            "get_status" => Self::GetStatus,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Water => write!(f, "water"),
            Self::LightOn => write!(f, "light_on"),
            Self::LightOff => write!(f, "light_off"),
            Self::SetLightBrightness => write!(f, "set_light_brightness"),
            Self::GetStatus => write!(f, "get_status"),
            Self::Unknown(name) => write!(f, "unknown({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: Action,
    pub parameters: BTreeMap<String, f64>,
}

impl Command {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).copied()
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ControlMsg {
    #[serde(default)]
    commands: Vec<WireCommand>,
}

#[derive(Debug, Deserialize)]
struct WireCommand {
    action: String,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

impl From<WireCommand> for Command {
    fn from(w: WireCommand) -> Self {
        // Parameters are numeric by contract; anything else is dropped.
        let parameters = w
            .parameters
            .into_iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k, n)))
            .collect();
        Self {
            action: Action::from_wire(&w.action),
            parameters,
        }
    }
}

/// Decode a control response body into commands, in server order.
pub fn decode_commands(body: &str) -> Result<Vec<Command>, serde_json::Error> {
    let msg: ControlMsg = serde_json::from_str(body)?;
    Ok(msg.commands.into_iter().map(Command::from).collect())
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub struct CommandPoller<T> {
    transport: T,
}

impl<T: Transport> CommandPoller<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Ask the server for pending commands.  Every failure mode yields an
    /// empty batch; "nothing pending" is the common case.
    pub async fn poll(&self, identity: &DeviceIdentity, link: ConnectionState) -> Vec<Command> {
        if link != ConnectionState::Connected {
            return Vec::new();
        }

        let request = Request {
            method: Method::Patch,
            url: identity.url(CONTROL_PATH),
            headers: auth_headers(identity),
            body: None,
        };

        let resp = match self.transport.send(request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!("command poll failed: {e}");
                return Vec::new();
            }
        };

        if resp.status != COMMANDS_AVAILABLE {
            tracing::debug!(status = resp.status, "no commands pending");
            return Vec::new();
        }

        match decode_commands(&resp.body) {
            Ok(commands) => {
                if !commands.is_empty() {
                    tracing::info!(
                        count = commands.len(),
                        actions = ?commands.iter().map(|c| c.action.to_string()).collect::<Vec<_>>(),
                        "commands received"
                    );
                }
                commands
            }
            Err(e) => {
                tracing::warn!(body = %resp.body, "malformed command payload: {e}");
                Vec::new()
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
