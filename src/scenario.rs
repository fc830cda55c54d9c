//! Scenario scheduler: a set of gateways replayed in randomized rounds.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::Init;
use crate::config::parse_duration;
use crate::gateway::{Gateway, GatewayInfo};
use crate::node::{parse_key, Node};
use crate::stats::{Stats, StatsSnapshot};
use crate::{HammerError, Result};

/// Uniform random wait in `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRange {
    pub min: Duration,
    pub max: Duration,
}

impl SleepRange {
    pub fn parse(field: &str, values: &[String; 2]) -> Result<Self> {
        Ok(Self { min: parse_duration(field, &values[0])?, max: parse_duration(field, &values[1])? })
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

pub struct Scenario {
    pub uuid: Uuid,
    gateways: Vec<Arc<Gateway>>,
    scenario_sleep: SleepRange,
    gateway_sleep: SleepRange,
    pub nb_scenario_replay_laps: i32,
    pub with_join: bool,
    f_cnt: AtomicU32,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    stats: Arc<Stats>,
}

/// Handle on a running cron loop
pub struct CronHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CronHandle {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the loop to exit.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            log::error!("Scenario cron task failed: {}", e);
        }
    }
}

impl Scenario {
    /// Build every gateway and node. Nothing is allocated if any field is invalid.
    pub fn new(init: &Init, stats: Arc<Stats>) -> Result<Self> {
        let receive_timeout = parse_duration("receiveTimeoutTime", &init.receive_timeout_time)?;
        let scenario_sleep = SleepRange::parse("scenarioSleepTime", &init.scenario_sleep_time)?;
        let gateway_sleep = SleepRange::parse("gatewaySleepTime", &init.gateway_sleep_time)?;
        let [min_nodes, max_nodes] = init.nb_node;
        if min_nodes > max_nodes {
            return Err(HammerError::InvalidConfig(format!("nbNode min {} exceeds max {}", min_nodes, max_nodes)));
        }
        let app_s_key = parse_key(&init.app_s_key)?;
        let nw_s_key = parse_key(&init.nw_s_key)?;
        for payload in &init.payloads {
            hex::decode(&payload.value)?;
        }

        let mut rng = rand::thread_rng();
        let gateways = (0..init.nb_gateway)
            .map(|_| {
                let nodes = (0..rng.gen_range(min_nodes..=max_nodes))
                    .map(|_| {
                        Node::with_identity(
                            rand::random(),
                            rand::random(),
                            app_s_key,
                            nw_s_key,
                            init.payloads.clone(),
                            init.random_payloads,
                        )
                    })
                    .collect();
                Arc::new(Gateway::new(
                    init.ns_address.clone(),
                    receive_timeout,
                    init.rxpk_date,
                    init.nb_scenario_replay_laps,
                    nodes,
                    Arc::clone(&stats),
                ))
            })
            .collect();

        Ok(Self {
            uuid: Uuid::new_v4(),
            gateways,
            scenario_sleep,
            gateway_sleep,
            nb_scenario_replay_laps: init.nb_scenario_replay_laps,
            with_join: init.with_join,
            f_cnt: AtomicU32::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stats,
        })
    }

    pub fn gateways(&self) -> &[Arc<Gateway>] {
        &self.gateways
    }

    pub fn gateway_infos(&self) -> Vec<GatewayInfo> {
        self.gateways.iter().map(|g| g.info()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.gateways.iter().map(|g| g.node_count()).sum()
    }

    pub fn f_cnt(&self) -> u32 {
        self.f_cnt.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the single start of this scenario; false if already claimed.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn laps_completed(&self) -> bool {
        self.nb_scenario_replay_laps > 0 && self.gateways.iter().all(|g| g.all_laps_completed())
    }

    /// Join every gateway concurrently and wait for all of them.
    pub async fn join(&self) {
        let mut set = JoinSet::new();
        for gateway in &self.gateways {
            let gateway = Arc::clone(gateway);
            let with_join = self.with_join;
            set.spawn(async move { gateway.join(with_join).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                log::error!("Scenario {} join task failed: {}", self.uuid, e);
            }
        }
        log::info!("Scenario {} joined {} gateways", self.uuid, self.gateways.len());
    }

    /// Run one round now, then one per scenario sleep until cancelled.
    /// The loop exits only after every gateway round it launched has settled.
    pub fn cron(self: &Arc<Self>) -> CronHandle {
        let scenario = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut rounds = JoinSet::new();
            if scenario.round(&mut rounds).await {
                loop {
                    tokio::select! {
                        _ = scenario.cancel.cancelled() => break,
                        _ = tokio::time::sleep(scenario.scenario_sleep.sample()) => {
                            if !scenario.round(&mut rounds).await {
                                break;
                            }
                        }
                    }
                    while rounds.try_join_next().is_some() {}
                }
            }
            while let Some(done) = rounds.join_next().await {
                if let Err(e) = done {
                    log::error!("Scenario {} gateway round failed: {}", scenario.uuid, e);
                }
            }
            log::info!("Scenario {} cron loop exited", scenario.uuid);
        });
        CronHandle { token: self.cancel.clone(), task }
    }

    /// Start every gateway once; false when scheduling must stop.
    async fn round(&self, rounds: &mut JoinSet<()>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.laps_completed() {
            log::info!("Scenario {} completed {} replay laps", self.uuid, self.nb_scenario_replay_laps);
            self.cancel.cancel();
            return false;
        }
        self.stats.record_round();
        for gateway in &self.gateways {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.gateway_sleep.sample()) => {}
            }
            // One counter value per gateway, shared by all its nodes.
            let f_cnt = self.f_cnt.fetch_add(1, Ordering::SeqCst);
            let gateway = Arc::clone(gateway);
            rounds.spawn(async move {
                gateway.start(f_cnt).await;
            });
        }
        true
    }

    /// Stop scheduling without reporting; in-flight rounds still settle in the cron task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop scheduling and report this scenario's totals. Safe to call from any task, any number of times.
    pub fn stop(&self) -> StatsSnapshot {
        self.cancel.cancel();
        let totals = self.stats.snapshot();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            log::info!(
                "Scenario {} stopped: pushed={} acked={} unacked={} rounds={}",
                self.uuid,
                totals.push_data_sent,
                totals.acked,
                totals.unacked,
                totals.rounds
            );
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Payload;
    use crate::packet::packet_type;
    use tokio::net::UdpSocket;

    fn init(address: &str) -> Init {
        Init {
            ns_address: address.to_string(),
            nb_gateway: 1,
            nb_node: [1, 1],
            scenario_sleep_time: ["50ms".to_string(), "50ms".to_string()],
            gateway_sleep_time: ["0ms".to_string(), "0ms".to_string()],
            receive_timeout_time: "100ms".to_string(),
            payloads: vec![Payload::new("01", None)],
            ..Init::default()
        }
    }

    /// Loopback network server acking every PUSH_DATA until `quiet` passes without traffic.
    async fn acking_server(quiet: Duration) -> (String, tokio::task::JoinHandle<usize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut pushes = 0;
            let mut buf = [0u8; 2048];
            while let Ok(Ok((n, from))) = tokio::time::timeout(quiet, socket.recv_from(&mut buf)).await {
                if n >= 4 && buf[3] == packet_type::PUSH_DATA {
                    pushes += 1;
                    socket.send_to(&[2, buf[1], buf[2], packet_type::PUSH_ACK], from).await.unwrap();
                }
            }
            pushes
        });
        (address, handle)
    }

    async fn sink() -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap().to_string();
        (socket, address)
    }

    #[test]
    fn test_invalid_durations_are_fatal() {
        let stats = Arc::new(Stats::new());
        let mut bad = init("127.0.0.1:1700");
        bad.receive_timeout_time = "later".to_string();
        assert!(matches!(Scenario::new(&bad, stats.clone()), Err(HammerError::InvalidDuration { .. })));

        let mut bad = init("127.0.0.1:1700");
        bad.scenario_sleep_time[1] = "x".to_string();
        assert!(Scenario::new(&bad, stats.clone()).is_err());

        let mut bad = init("127.0.0.1:1700");
        bad.gateway_sleep_time[0] = "".to_string();
        assert!(Scenario::new(&bad, stats).is_err());
    }

    #[test]
    fn test_invalid_node_range_and_keys() {
        let stats = Arc::new(Stats::new());
        let mut bad = init("127.0.0.1:1700");
        bad.nb_node = [3, 1];
        assert!(Scenario::new(&bad, stats.clone()).is_err());

        let mut bad = init("127.0.0.1:1700");
        bad.nw_s_key = "abcd".to_string();
        assert!(Scenario::new(&bad, stats).is_err());
    }

    #[test]
    fn test_node_counts_within_range() {
        let mut config = init("127.0.0.1:1700");
        config.nb_gateway = 20;
        config.nb_node = [2, 4];
        let scenario = Scenario::new(&config, Arc::new(Stats::new())).unwrap();
        assert_eq!(scenario.gateways().len(), 20);
        assert!(scenario.gateways().iter().all(|g| (2..=4).contains(&g.node_count())));
    }

    #[test]
    fn test_sleep_range_sample() {
        let range = SleepRange { min: Duration::from_millis(10), max: Duration::from_millis(20) };
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= range.min && d <= range.max);
        }
        let inverted = SleepRange { min: Duration::from_millis(10), max: Duration::from_millis(5) };
        assert_eq!(inverted.sample(), Duration::from_millis(10));
    }

    #[test]
    fn test_single_start() {
        let scenario = Scenario::new(&init("127.0.0.1:1700"), Arc::new(Stats::new())).unwrap();
        assert!(scenario.mark_started());
        assert!(!scenario.mark_started());
    }

    #[tokio::test]
    async fn test_frame_counter_increments_per_gateway() {
        let (_sink, address) = sink().await;
        let mut config = init(&address);
        config.nb_gateway = 3;
        config.nb_node = [2, 2];
        config.scenario_sleep_time = ["1h".to_string(), "1h".to_string()];
        let scenario = Arc::new(Scenario::new(&config, Arc::new(Stats::new())).unwrap());

        let handle = scenario.cron();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scenario.f_cnt(), 3);

        scenario.stop();
        tokio::time::timeout(Duration::from_secs(2), handle.finished()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cron_stops_on_lap_completion() {
        let (_sink, address) = sink().await;
        let mut config = init(&address);
        config.nb_scenario_replay_laps = 1;
        let scenario = Arc::new(Scenario::new(&config, Arc::new(Stats::new())).unwrap());

        let handle = scenario.cron();
        tokio::time::timeout(Duration::from_secs(3), handle.finished()).await.unwrap();

        assert!(scenario.laps_completed());
        assert!(scenario.is_cancelled());
        assert_eq!(scenario.f_cnt(), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_endless_cron() {
        let (_sink, address) = sink().await;
        let scenario = Arc::new(Scenario::new(&init(&address), Arc::new(Stats::new())).unwrap());

        let handle = scenario.cron();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let stopper = Arc::clone(&scenario);
        tokio::spawn(async move { stopper.stop() }).await.unwrap();
        assert!(handle.is_cancelled());
        tokio::time::timeout(Duration::from_secs(2), handle.finished()).await.unwrap();

        assert!(!scenario.laps_completed());
        assert!(scenario.f_cnt() >= 1);
        // A second stop is a no-op
        scenario.stop();
    }

    #[tokio::test]
    async fn test_totals_include_last_round_acks() {
        let (address, server) = acking_server(Duration::from_millis(800)).await;
        let mut config = init(&address);
        config.receive_timeout_time = "300ms".to_string();
        config.nb_scenario_replay_laps = 1;
        let scenario = Arc::new(Scenario::new(&config, Arc::new(Stats::new())).unwrap());

        tokio::time::timeout(Duration::from_secs(3), scenario.cron().finished()).await.unwrap();
        let totals = scenario.stop();
        assert_eq!(totals.push_data_sent, 1);
        assert_eq!(totals.acked, totals.push_data_sent);
        assert_eq!(totals.unacked, 0);
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_each_scenario_reports_its_own_totals() {
        let (_sink, address) = sink().await;
        let agent = Arc::new(Stats::new());
        let mut config = init(&address);
        config.nb_scenario_replay_laps = 1;
        let ran = Arc::new(Scenario::new(&config, Arc::new(Stats::with_parent(agent.clone()))).unwrap());
        let idle = Scenario::new(&config, Arc::new(Stats::with_parent(agent.clone()))).unwrap();

        tokio::time::timeout(Duration::from_secs(3), ran.cron().finished()).await.unwrap();
        let ran_totals = ran.stop();
        let idle_totals = idle.stop();
        assert_eq!(ran_totals.push_data_sent, 1);
        assert_eq!(ran_totals.rounds, 1);
        assert_eq!(idle_totals.push_data_sent, 0);
        assert_eq!(idle_totals.rounds, 0);
        assert_eq!(agent.snapshot().push_data_sent, 1);
    }
}
