//! Command bus envelope and typed sub-messages.
//!
//! Envelope: `{"cmd": NAME, "payload": {...}}`

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewayInfo;
use crate::node::Payload;
use crate::{HammerError, Result, DEFAULT_NS_ADDRESS, DEFAULT_RECEIVE_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    NewLorhammer,
    LorhammerAdded,
    Register,
    Init,
    Start,
    Stop,
    Shutdown,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::NewLorhammer => "NEWLORHAMMER",
            CommandName::LorhammerAdded => "LORHAMMERADDED",
            CommandName::Register => "REGISTER",
            CommandName::Init => "INIT",
            CommandName::Start => "START",
            CommandName::Stop => "STOP",
            CommandName::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = HammerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEWLORHAMMER" => Ok(CommandName::NewLorhammer),
            "LORHAMMERADDED" => Ok(CommandName::LorhammerAdded),
            "REGISTER" => Ok(CommandName::Register),
            "INIT" => Ok(CommandName::Init),
            "START" => Ok(CommandName::Start),
            "STOP" => Ok(CommandName::Stop),
            "SHUTDOWN" => Ok(CommandName::Shutdown),
            other => Err(HammerError::UnknownCommand(other.to_string())),
        }
    }
}

/// Bus message: command name plus raw payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Command {
    pub fn new<T: Serialize>(name: CommandName, payload: &T) -> Result<Self> {
        Ok(Self { cmd: name.as_str().to_string(), payload: serde_json::to_value(payload)? })
    }

    pub fn empty(name: CommandName) -> Self {
        Self { cmd: name.as_str().to_string(), payload: serde_json::Value::Null }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn name(&self) -> Result<CommandName> {
        self.cmd.parse()
    }

    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ============================================================================
// Sub-messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLorhammer {
    pub callback_topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub scenario_uuid: Uuid,
    pub gateways: Vec<GatewayInfo>,
    pub callback_topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Start {
    pub scenario_uuid: Uuid,
}

/// Scenario construction config sent by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Init {
    #[serde(default = "default_ns_address")]
    pub ns_address: String,
    #[serde(default = "default_nb_gateway")]
    pub nb_gateway: usize,
    /// `[min, max]` nodes per gateway
    #[serde(default = "default_nb_node")]
    pub nb_node: [usize; 2],
    #[serde(default = "default_scenario_sleep_time")]
    pub scenario_sleep_time: [String; 2],
    #[serde(default = "default_gateway_sleep_time")]
    pub gateway_sleep_time: [String; 2],
    #[serde(default)]
    pub app_s_key: String,
    #[serde(default)]
    pub nw_s_key: String,
    #[serde(default)]
    pub with_join: bool,
    #[serde(default)]
    pub payloads: Vec<Payload>,
    #[serde(default)]
    pub rxpk_date: Option<i64>,
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_time: String,
    #[serde(default)]
    pub random_payloads: bool,
    /// Zero or negative: replay until stopped
    #[serde(default)]
    pub nb_scenario_replay_laps: i32,
    #[serde(default)]
    pub description: String,
}

fn default_ns_address() -> String { DEFAULT_NS_ADDRESS.to_string() }
fn default_nb_gateway() -> usize { 1 }
fn default_nb_node() -> [usize; 2] { [1, 1] }
fn default_scenario_sleep_time() -> [String; 2] { ["10s".to_string(), "10s".to_string()] }
fn default_gateway_sleep_time() -> [String; 2] { ["100ms".to_string(), "500ms".to_string()] }
fn default_receive_timeout() -> String { DEFAULT_RECEIVE_TIMEOUT.to_string() }

impl Default for Init {
    fn default() -> Self {
        Self {
            ns_address: default_ns_address(),
            nb_gateway: default_nb_gateway(),
            nb_node: default_nb_node(),
            scenario_sleep_time: default_scenario_sleep_time(),
            gateway_sleep_time: default_gateway_sleep_time(),
            app_s_key: String::new(),
            nw_s_key: String::new(),
            with_join: false,
            payloads: vec![],
            rxpk_date: None,
            receive_timeout_time: default_receive_timeout(),
            random_payloads: false,
            nb_scenario_replay_laps: 0,
            description: String::new(),
        }
    }
}
