//! Pluggable orchestrator collaborators: provisioning, deployment and checks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::agent::Agent;
use crate::bus::CommandBus;
use crate::command::Register;
use crate::config::{AgentConfig, TestConfig};
use crate::stats::StatsSnapshot;
use crate::{HammerError, Result};

// ============================================================================
// Provisioner
// ============================================================================

/// Makes a registered scenario's devices known to the network server.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, register: &Register) -> Result<()>;
}

/// Accepts every registration
pub struct NoneProvisioner;

#[async_trait]
impl Provisioner for NoneProvisioner {
    async fn provision(&self, register: &Register) -> Result<()> {
        log::debug!(
            "Nothing to provision for scenario {} ({} gateways)",
            register.scenario_uuid,
            register.gateways.len()
        );
        Ok(())
    }
}

// ============================================================================
// Deployer
// ============================================================================

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, config: &TestConfig) -> Result<()>;
}

/// Agents are started out of band
pub struct NoneDeployer;

#[async_trait]
impl Deployer for NoneDeployer {
    async fn deploy(&self, _config: &TestConfig) -> Result<()> {
        log::info!("Deployer none: expecting externally started agents");
        Ok(())
    }
}

/// Spawns agents inside this process, on the same bus as the orchestrator.
pub struct LocalDeployer {
    bus: Arc<dyn CommandBus>,
    agent_config: AgentConfig,
    agents: Mutex<Vec<(Arc<Agent>, JoinHandle<()>)>>,
}

impl LocalDeployer {
    pub fn new(bus: Arc<dyn CommandBus>, agent_config: AgentConfig) -> Self {
        Self { bus, agent_config, agents: Mutex::new(Vec::new()) }
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.agents.lock().iter().map(|(agent, _)| Arc::clone(agent)).collect()
    }

    pub fn agent_stats(&self) -> Vec<StatsSnapshot> {
        self.agents.lock().iter().map(|(agent, _)| agent.stats()).collect()
    }

    /// Wait until every local agent has received SHUTDOWN; false once `max_wait` passes.
    pub async fn wait_for_shutdown(&self, max_wait: Duration) -> bool {
        let tokens: Vec<_> = self.agents.lock().iter().map(|(agent, _)| agent.shutdown_token()).collect();
        let all = async {
            for token in tokens {
                token.cancelled().await;
            }
        };
        tokio::time::timeout(max_wait, all).await.is_ok()
    }

    /// Stop every local agent's scenarios and its command loop.
    pub fn teardown(&self) {
        for (agent, task) in self.agents.lock().drain(..) {
            agent.stop_all();
            task.abort();
        }
    }
}

#[async_trait]
impl Deployer for LocalDeployer {
    async fn deploy(&self, config: &TestConfig) -> Result<()> {
        if config.local_agents == 0 {
            return Err(HammerError::Deploy("localAgents must be at least 1".to_string()));
        }
        let mut agents = self.agents.lock();
        for _ in 0..config.local_agents {
            let agent = Agent::new(Arc::clone(&self.bus), &self.agent_config)?;
            let task = agent.spawn();
            log::info!("Deployed local agent {}", agent.id());
            agents.push((agent, task));
        }
        Ok(())
    }
}

// ============================================================================
// Checker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSuccess {
    pub checker: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckError {
    pub checker: String,
    pub reason: String,
}

/// Post-test verification contributing to the report
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self) -> (Vec<CheckSuccess>, Vec<CheckError>);
}

pub struct NoneChecker;

#[async_trait]
impl Checker for NoneChecker {
    async fn check(&self) -> (Vec<CheckSuccess>, Vec<CheckError>) {
        (vec![], vec![])
    }
}
