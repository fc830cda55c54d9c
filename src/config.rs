//! Configuration files and duration strings.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::Init;
use crate::{HammerError, Result, ORCHESTRATOR_TOPIC};

/// Parse a human duration (`"500ms"`, `"2s"`, `"1m30s"`); `field` names it in errors.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|_| HammerError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

// ============================================================================
// Agent Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_orchestrator_topic")]
    pub orchestrator_topic: String,
    /// How long to keep announcing before giving up
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout: String,
    #[serde(default = "default_announce_period")]
    pub announce_period: String,
}

fn default_orchestrator_topic() -> String { ORCHESTRATOR_TOPIC.to_string() }
fn default_registration_timeout() -> String { "1m".to_string() }
fn default_announce_period() -> String { "1s".to_string() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_topic: default_orchestrator_topic(),
            registration_timeout: default_registration_timeout(),
            announce_period: default_announce_period(),
        }
    }
}

// ============================================================================
// Test Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestType {
    /// One INIT, then wait for the test duration
    OneShot,
    /// Re-send INIT every `repeatTime` until the test duration elapses
    Repeat,
    /// No traffic; only deploy, check and report
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeployerKind {
    None,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    #[serde(default = "default_test_type")]
    pub test_type: TestType,
    #[serde(default = "default_test_duration")]
    pub test_duration: String,
    #[serde(default = "default_repeat_time")]
    pub repeat_time: String,
    /// Agents required in the fleet before traffic starts
    #[serde(default = "default_min_agents")]
    pub min_agents: usize,
    #[serde(default = "default_fleet_wait")]
    pub fleet_wait: String,
    #[serde(default)]
    pub init: Init,
    #[serde(default)]
    pub shutdown_all_at_end: bool,
    #[serde(default = "default_report_path")]
    pub report_path: String,
    #[serde(default = "default_deployer")]
    pub deployer: DeployerKind,
    /// Agents spawned by the local deployer
    #[serde(default = "default_min_agents")]
    pub local_agents: usize,
}

fn default_test_type() -> TestType { TestType::OneShot }
fn default_test_duration() -> String { "1m".to_string() }
fn default_repeat_time() -> String { "30s".to_string() }
fn default_min_agents() -> usize { 1 }
fn default_fleet_wait() -> String { "30s".to_string() }
fn default_report_path() -> String { "report.json".to_string() }
fn default_deployer() -> DeployerKind { DeployerKind::Local }

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            test_type: default_test_type(),
            test_duration: default_test_duration(),
            repeat_time: default_repeat_time(),
            min_agents: default_min_agents(),
            fleet_wait: default_fleet_wait(),
            init: Init::default(),
            shutdown_all_at_end: false,
            report_path: default_report_path(),
            deployer: default_deployer(),
            local_agents: default_min_agents(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

/// Load a TOML or JSON config by extension; a missing file yields defaults.
pub fn load_config<T: DeserializeOwned + Default>(path: &str) -> Result<T> {
    if !Path::new(path).exists() {
        log::warn!("Config file not found: {}, using defaults", path);
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;

    if path.ends_with(".json") {
        Ok(serde_json::from_str(&content)?)
    } else if path.ends_with(".toml") {
        Ok(toml::from_str(&content)?)
    } else {
        // Try TOML first, then JSON
        toml::from_str(&content).or_else(|toml_err| {
            serde_json::from_str(&content)
                .map_err(|_| HammerError::InvalidConfig(format!("neither TOML nor JSON: {}", toml_err)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("x", "500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("x", "1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("x", " 2s ").unwrap(), Duration::from_secs(2));
        match parse_duration("receiveTimeoutTime", "soon") {
            Err(HammerError::InvalidDuration { field, value }) => {
                assert_eq!(field, "receiveTimeoutTime");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_load_toml_test_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
testType = "repeat"
testDuration = "5s"
minAgents = 2

[init]
nsAddress = "127.0.0.1:1700"
nbGateway = 4
nbNode = [1, 3]
"#
        )
        .unwrap();

        let config: TestConfig = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.test_type, TestType::Repeat);
        assert_eq!(config.min_agents, 2);
        assert_eq!(config.init.nb_gateway, 4);
        assert_eq!(config.init.nb_node, [1, 3]);
        assert_eq!(config.deployer, DeployerKind::Local);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config: AgentConfig = load_config("/definitely/not/here.toml").unwrap();
        assert_eq!(config.orchestrator_topic, ORCHESTRATOR_TOPIC);
    }
}
