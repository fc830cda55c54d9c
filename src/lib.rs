//! Lorhammer - LoRaWAN network load generator
//!
//! Agents ("hammers") simulate many virtual radio gateways, each fronting a
//! set of simulated end devices, and replay uplink traffic against a real
//! network server using the Semtech packet-forwarder UDP protocol. An
//! orchestrator drives a fleet of agents over a publish/subscribe command bus.

use std::io;

use thiserror::Error;

pub mod agent;
pub mod broker;
pub mod bus;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod gateway;
pub mod lorawan;
pub mod node;
pub mod orchestrator;
pub mod packet;
pub mod registry;
pub mod scenario;
pub mod stats;

// Re-exports for convenience
pub use agent::Agent;
pub use broker::{Broker, TcpBus};
pub use bus::{CommandBus, LocalBus};
pub use command::{Command, CommandName, Init};
pub use gateway::Gateway;
pub use node::{Node, Payload};
pub use orchestrator::{Orchestrator, TestRunner};
pub use scenario::Scenario;
pub use stats::{Stats, StatsSnapshot};

// ============================================================================
// Constants
// ============================================================================

/// Shared topic every agent announces itself on.
pub const ORCHESTRATOR_TOPIC: &str = "/lorhammer/orchestrator";

/// Prefix of the per-agent command topic.
pub const AGENT_TOPIC_PREFIX: &str = "/lorhammer/";

pub const DEFAULT_NS_ADDRESS: &str = "127.0.0.1:1700";
pub const DEFAULT_RECEIVE_TIMEOUT: &str = "2s";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum HammerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(uuid::Uuid),

    #[error("Provisioning error: {0}")]
    Provision(String),

    #[error("Deployment error: {0}")]
    Deploy(String),

    #[error("Bus error: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, HammerError>;

/// Per-agent topic for the given agent id.
pub fn agent_topic(agent_id: &uuid::Uuid) -> String {
    format!("{}{}", AGENT_TOPIC_PREFIX, agent_id)
}
