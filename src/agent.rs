//! Agent ("hammer") side of the command protocol.
//!
//! An agent announces itself until the orchestrator acknowledges it, builds a
//! scenario per INIT, runs it on START and tears everything down on STOP or
//! SHUTDOWN. Malformed or unknown commands are logged and ignored.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{CommandBus, Subscription};
use crate::command::{Command, CommandName, Init, NewLorhammer, Register, Start};
use crate::config::{parse_duration, AgentConfig};
use crate::registry::Registry;
use crate::scenario::Scenario;
use crate::stats::{Stats, StatsSnapshot};
use crate::{agent_topic, HammerError, Result};

pub type ScenarioRegistry = Registry<Uuid, Arc<Scenario>>;

pub struct Agent {
    id: Uuid,
    topic: String,
    orchestrator_topic: String,
    registration_timeout: Duration,
    announce_period: Duration,
    bus: Arc<dyn CommandBus>,
    scenarios: ScenarioRegistry,
    stats: Arc<Stats>,
    waiters: Mutex<JoinSet<()>>,
    registered: CancellationToken,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(bus: Arc<dyn CommandBus>, config: &AgentConfig) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();
        Ok(Arc::new(Self {
            id,
            topic: agent_topic(&id),
            orchestrator_topic: config.orchestrator_topic.clone(),
            registration_timeout: parse_duration("registrationTimeout", &config.registration_timeout)?,
            announce_period: parse_duration("announcePeriod", &config.announce_period)?,
            bus,
            scenarios: ScenarioRegistry::new(),
            stats: Arc::new(Stats::new()),
            waiters: Mutex::new(JoinSet::new()),
            registered: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn scenarios(&self) -> &ScenarioRegistry {
        &self.scenarios
    }

    /// Totals across every scenario this agent ran
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_cancelled()
    }

    /// Cancelled once SHUTDOWN has been handled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to the agent topic, then announce and serve commands in the background.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let subscription = self.bus.subscribe(&self.topic);
        tokio::spawn(Arc::clone(self).announce());
        tokio::spawn(Arc::clone(self).serve(subscription))
    }

    async fn serve(self: Arc<Self>, mut subscription: Subscription) {
        log::info!("Agent {} listening on {}", self.id, self.topic);
        loop {
            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(raw) => raw,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(&raw).await {
                log::error!("Agent {} command failed: {} (raw: {})", self.id, e, String::from_utf8_lossy(&raw));
            }
        }
        log::info!("Agent {} stopped serving commands", self.id);
    }

    /// Announce NEWLORHAMMER every period until acknowledged or the max wait elapses.
    async fn announce(self: Arc<Self>) {
        let deadline = Instant::now() + self.registration_timeout;
        let mut ticker = tokio::time::interval(self.announce_period.max(Duration::from_millis(1)));
        let announce = NewLorhammer { callback_topic: self.topic.clone() };
        loop {
            tokio::select! {
                _ = self.registered.cancelled() => return,
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    log::error!(
                        "Agent {} not acknowledged by orchestrator after {:?}, giving up",
                        self.id,
                        self.registration_timeout
                    );
                    return;
                }
                _ = ticker.tick() => {
                    let sent = match Command::new(CommandName::NewLorhammer, &announce) {
                        Ok(command) => self.bus.send(&self.orchestrator_topic, &command).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        log::warn!("Agent {} announce failed: {}", self.id, e);
                    }
                }
            }
        }
    }

    pub async fn dispatch(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        let command = Command::decode(raw)?;
        let name = match command.name() {
            Ok(name) => name,
            Err(_) => {
                log::warn!("Agent {} ignores unknown command {} (payload: {})", self.id, command.cmd, command.payload);
                return Ok(());
            }
        };

        match name {
            CommandName::LorhammerAdded => {
                if !self.registered.is_cancelled() {
                    log::info!("Agent {} registered with orchestrator", self.id);
                }
                self.registered.cancel();
                Ok(())
            }
            CommandName::Init => self.handle_init(&command.parse_payload()?).await,
            CommandName::Start => self.handle_start(&command.parse_payload()?),
            CommandName::Stop => {
                self.stop_all();
                Ok(())
            }
            CommandName::Shutdown => {
                self.stop_all();
                log::info!("Agent {} shutting down", self.id);
                self.shutdown.cancel();
                Ok(())
            }
            other => {
                log::warn!("Agent {} ignores {} (payload: {})", self.id, other, command.payload);
                Ok(())
            }
        }
    }

    async fn handle_init(&self, init: &Init) -> Result<()> {
        let scenario = Arc::new(Scenario::new(init, Arc::new(Stats::with_parent(Arc::clone(&self.stats))))?);
        let register = Register {
            scenario_uuid: scenario.uuid,
            gateways: scenario.gateway_infos(),
            callback_topic: self.topic.clone(),
        };
        log::info!(
            "Agent {} built scenario {} ({} gateways, {} nodes)",
            self.id,
            scenario.uuid,
            scenario.gateways().len(),
            scenario.node_count()
        );
        self.scenarios.register(scenario.uuid, scenario);
        self.bus
            .send(&self.orchestrator_topic, &Command::new(CommandName::Register, &register)?)
            .await
    }

    fn handle_start(&self, start: &Start) -> Result<()> {
        let scenario = self
            .scenarios
            .lookup(&start.scenario_uuid)
            .ok_or(HammerError::ScenarioNotFound(start.scenario_uuid))?;
        if !scenario.mark_started() {
            log::warn!("Scenario {} already started, START ignored", scenario.uuid);
            return Ok(());
        }

        let scenarios = self.scenarios.clone();
        let mut waiters = self.waiters.lock();
        while waiters.try_join_next().is_some() {}
        waiters.spawn(async move {
            scenario.join().await;
            scenario.cron().finished().await;
            scenarios.remove(&scenario.uuid);
            scenario.stop();
        });
        Ok(())
    }

    /// Stop and deregister every active scenario. Started scenarios report
    /// their totals once their in-flight rounds settle.
    pub fn stop_all(&self) {
        for (uuid, scenario) in self.scenarios.drain() {
            log::info!("Agent {} stopping scenario {}", self.id, uuid);
            if scenario.is_started() {
                scenario.cancel();
            } else {
                scenario.stop();
            }
        }
    }

    /// Wait until every started scenario has settled and reported.
    pub async fn settle(&self) {
        let mut waiters = std::mem::take(&mut *self.waiters.lock());
        while let Some(done) = waiters.join_next().await {
            if let Err(e) = done {
                log::error!("Agent {} scenario task failed: {}", self.id, e);
            }
        }
    }
}

/// Run one scenario without any command bus until lap completion or `shutdown`.
pub async fn run_standalone(init: &Init, shutdown: CancellationToken) -> Result<StatsSnapshot> {
    let scenario = Arc::new(Scenario::new(init, Arc::new(Stats::new()))?);
    log::info!(
        "Standalone scenario {}: {} gateways, {} nodes -> {}",
        scenario.uuid,
        scenario.gateways().len(),
        scenario.node_count(),
        init.ns_address
    );

    tokio::select! {
        _ = shutdown.cancelled() => return Ok(scenario.stop()),
        _ = scenario.join() => {}
    }
    let interrupt = tokio::spawn({
        let scenario = Arc::clone(&scenario);
        async move {
            shutdown.cancelled().await;
            log::info!("Standalone scenario {} interrupted", scenario.uuid);
            scenario.cancel();
        }
    });
    scenario.cron().finished().await;
    interrupt.abort();
    Ok(scenario.stop())
}
