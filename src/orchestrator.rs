//! Orchestrator side of the command protocol and the test lifecycle driver.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{CommandBus, Subscription};
use crate::collaborators::{CheckError, CheckSuccess, Checker, Deployer, Provisioner};
use crate::command::{Command, CommandName, Init, NewLorhammer, Register, Start};
use crate::config::{parse_duration, TestConfig, TestType};
use crate::registry::Registry;
use crate::{HammerError, Result, ORCHESTRATOR_TOPIC};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub topic: String,
    pub registered_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRecord {
    pub agent_topic: String,
    pub gateways: usize,
    pub nodes: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    bus: Arc<dyn CommandBus>,
    provisioner: Arc<dyn Provisioner>,
    fleet: Registry<String, AgentRecord>,
    scenarios: Registry<Uuid, ScenarioRecord>,
}

impl Orchestrator {
    pub fn new(bus: Arc<dyn CommandBus>, provisioner: Arc<dyn Provisioner>) -> Arc<Self> {
        Arc::new(Self { bus, provisioner, fleet: Registry::new(), scenarios: Registry::new() })
    }

    /// Agents that announced themselves, keyed by callback topic
    pub fn fleet(&self) -> &Registry<String, AgentRecord> {
        &self.fleet
    }

    /// Provisioned and started scenarios
    pub fn scenarios(&self) -> &Registry<Uuid, ScenarioRecord> {
        &self.scenarios
    }

    /// Subscribe to the orchestrator topic and serve it in the background.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let subscription = self.bus.subscribe(ORCHESTRATOR_TOPIC);
        tokio::spawn(Arc::clone(self).serve(subscription))
    }

    async fn serve(self: Arc<Self>, mut subscription: Subscription) {
        log::info!("Orchestrator listening on {}", ORCHESTRATOR_TOPIC);
        while let Some(raw) = subscription.recv().await {
            if let Err(e) = self.dispatch(&raw).await {
                log::error!("Orchestrator command failed: {} (raw: {})", e, String::from_utf8_lossy(&raw));
            }
        }
    }

    pub async fn dispatch(&self, raw: &[u8]) -> Result<()> {
        let command = Command::decode(raw)?;
        match command.name()? {
            CommandName::NewLorhammer => {
                let announce: NewLorhammer = command.parse_payload()?;
                let record = AgentRecord { topic: announce.callback_topic.clone(), registered_at: now_rfc3339() };
                if self.fleet.register(announce.callback_topic.clone(), record).is_none() {
                    log::info!("Agent {} joined the fleet ({} agents)", announce.callback_topic, self.fleet.len());
                }
                self.bus
                    .send(&announce.callback_topic, &Command::empty(CommandName::LorhammerAdded))
                    .await
            }
            CommandName::Register => {
                let register: Register = command.parse_payload()?;
                self.provisioner.provision(&register).await?;
                self.scenarios.register(
                    register.scenario_uuid,
                    ScenarioRecord {
                        agent_topic: register.callback_topic.clone(),
                        gateways: register.gateways.len(),
                        nodes: register.gateways.iter().map(|g| g.nodes.len()).sum(),
                    },
                );
                let start = Start { scenario_uuid: register.scenario_uuid };
                self.bus
                    .send(&register.callback_topic, &Command::new(CommandName::Start, &start)?)
                    .await
            }
            other => Err(HammerError::UnknownCommand(other.to_string())),
        }
    }

    async fn broadcast(&self, command: &Command) -> Result<()> {
        for topic in self.fleet.keys() {
            self.bus.send(&topic, command).await?;
        }
        Ok(())
    }

    pub async fn init_all(&self, init: &Init) -> Result<()> {
        log::info!("Sending INIT to {} agents", self.fleet.len());
        self.broadcast(&Command::new(CommandName::Init, init)?).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.broadcast(&Command::empty(CommandName::Stop)).await
    }

    pub async fn shutdown_all(&self) -> Result<()> {
        self.broadcast(&Command::empty(CommandName::Shutdown)).await
    }

    /// Wait until at least `min_agents` agents have announced themselves.
    pub async fn wait_for_fleet(&self, min_agents: usize, max_wait: Duration) -> Result<usize> {
        let deadline = Instant::now() + max_wait;
        loop {
            let size = self.fleet.len();
            if size >= min_agents {
                return Ok(size);
            }
            if Instant::now() >= deadline {
                return Err(HammerError::Deploy(format!(
                    "only {} of {} agents registered after {:?}",
                    size, min_agents, max_wait
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

// ============================================================================
// Test Report
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub started_at: String,
    pub ended_at: String,
    pub test_type: TestType,
    pub description: String,
    pub agents: usize,
    pub scenarios: usize,
    pub successes: Vec<CheckSuccess>,
    pub errors: Vec<CheckError>,
}

impl Report {
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

// ============================================================================
// Test Runner
// ============================================================================

pub struct TestRunner {
    orchestrator: Arc<Orchestrator>,
    deployer: Arc<dyn Deployer>,
    checkers: Vec<Arc<dyn Checker>>,
}

impl TestRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, deployer: Arc<dyn Deployer>) -> Self {
        Self { orchestrator, deployer, checkers: Vec::new() }
    }

    pub fn with_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Deploy, wait for the fleet, drive traffic, stop, check and write the report.
    pub async fn run(&self, config: &TestConfig) -> Result<Report> {
        let test_duration = parse_duration("testDuration", &config.test_duration)?;
        let repeat_time = parse_duration("repeatTime", &config.repeat_time)?;
        let fleet_wait = parse_duration("fleetWait", &config.fleet_wait)?;
        if config.test_type == TestType::Repeat && repeat_time.is_zero() {
            return Err(HammerError::InvalidConfig("repeatTime must be positive".to_string()));
        }

        let started_at = now_rfc3339();
        self.deployer.deploy(config).await?;
        let agents = self.orchestrator.wait_for_fleet(config.min_agents, fleet_wait).await?;
        log::info!("Fleet ready with {} agents, running {:?} test", agents, config.test_type);

        match config.test_type {
            TestType::OneShot => {
                self.orchestrator.init_all(&config.init).await?;
                tokio::time::sleep(test_duration).await;
            }
            TestType::Repeat => {
                let deadline = Instant::now() + test_duration;
                loop {
                    self.orchestrator.init_all(&config.init).await?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    tokio::time::sleep(repeat_time.min(remaining)).await;
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
            TestType::None => {}
        }

        self.orchestrator.stop_all().await?;

        let mut successes = Vec::new();
        let mut errors = Vec::new();
        for checker in &self.checkers {
            let (ok, failed) = checker.check().await;
            successes.extend(ok);
            errors.extend(failed);
        }

        let report = Report {
            started_at,
            ended_at: now_rfc3339(),
            test_type: config.test_type,
            description: config.init.description.clone(),
            agents: self.orchestrator.fleet().len(),
            scenarios: self.orchestrator.scenarios().len(),
            successes,
            errors,
        };
        report.write(&config.report_path)?;
        log::info!(
            "Report written to {}: {} successes, {} errors",
            config.report_path,
            report.successes.len(),
            report.errors.len()
        );

        if config.shutdown_all_at_end {
            self.orchestrator.shutdown_all().await?;
        }
        Ok(report)
    }
}
