//! Full agent/orchestrator runs over the in-process bus and the TCP broker against a loopback network server.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use lorhammer::collaborators::{LocalDeployer, NoneChecker, NoneProvisioner};
use lorhammer::command::{NewLorhammer, Start};
use lorhammer::config::{AgentConfig, DeployerKind, TestConfig, TestType};
use lorhammer::packet::packet_type;
use lorhammer::{
    Agent, Broker, Command, CommandBus, CommandName, Init, LocalBus, Orchestrator, Payload, TcpBus, TestRunner,
};

fn fast_agent_config() -> AgentConfig {
    AgentConfig {
        registration_timeout: "5s".to_string(),
        announce_period: "20ms".to_string(),
        ..AgentConfig::default()
    }
}

fn one_gateway_init(ns_address: &str) -> Init {
    Init {
        ns_address: ns_address.to_string(),
        nb_gateway: 1,
        nb_node: [1, 1],
        scenario_sleep_time: ["1h".to_string(), "1h".to_string()],
        gateway_sleep_time: ["0ms".to_string(), "0ms".to_string()],
        receive_timeout_time: "200ms".to_string(),
        payloads: vec![Payload::new("cafe", None)],
        ..Init::default()
    }
}

/// Ack every PUSH_DATA and PULL_DATA; returns the packet type of each datagram seen until `quiet` passes.
async fn serve_network(socket: &UdpSocket, quiet: Duration) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok(Ok((n, from))) = tokio::time::timeout(quiet, socket.recv_from(&mut buf)).await {
        if n < 12 {
            continue;
        }
        let kind = buf[3];
        seen.push(kind);
        let ack = match kind {
            packet_type::PUSH_DATA => packet_type::PUSH_ACK,
            packet_type::PULL_DATA => packet_type::PULL_ACK,
            _ => continue,
        };
        socket.send_to(&[buf[0], buf[1], buf[2], ack], from).await.unwrap();
    }
    seen
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_init_then_start_sends_one_push_data() {
    let network = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bus = Arc::new(LocalBus::new());
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    orchestrator.spawn();
    let agent = Agent::new(bus.clone(), &fast_agent_config()).unwrap();
    agent.spawn();

    wait_until(|| agent.is_registered()).await;
    let init = one_gateway_init(&network.local_addr().unwrap().to_string());
    orchestrator.init_all(&init).await.unwrap();

    let seen = serve_network(&network, Duration::from_millis(500)).await;
    assert_eq!(seen.iter().filter(|&&k| k == packet_type::PULL_DATA).count(), 1);
    assert_eq!(seen.iter().filter(|&&k| k == packet_type::PUSH_DATA).count(), 1);

    let totals = agent.stats();
    assert_eq!(totals.push_data_sent, 1);
    assert_eq!(totals.acked, 1);
    assert_eq!(totals.unacked, 0);
    assert_eq!(agent.scenarios().len(), 1);

    // A second START for the same scenario is ignored
    let uuid = orchestrator.scenarios().keys()[0];
    let again = Command::new(CommandName::Start, &Start { scenario_uuid: uuid }).unwrap();
    bus.send(agent.topic(), &again).await.unwrap();
    let seen = serve_network(&network, Duration::from_millis(300)).await;
    assert!(seen.is_empty());

    bus.send(agent.topic(), &Command::empty(CommandName::Stop)).await.unwrap();
    wait_until(|| agent.scenarios().is_empty()).await;
}

#[tokio::test]
async fn test_scenario_deregisters_itself_after_laps() {
    let network = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bus = Arc::new(LocalBus::new());
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    orchestrator.spawn();
    let agent = Agent::new(bus.clone(), &fast_agent_config()).unwrap();
    agent.spawn();
    wait_until(|| agent.is_registered()).await;

    let mut init = one_gateway_init(&network.local_addr().unwrap().to_string());
    init.scenario_sleep_time = ["30ms".to_string(), "30ms".to_string()];
    init.nb_scenario_replay_laps = 2;
    orchestrator.init_all(&init).await.unwrap();

    let seen = serve_network(&network, Duration::from_millis(500)).await;
    assert_eq!(seen.iter().filter(|&&k| k == packet_type::PUSH_DATA).count(), 2);
    wait_until(|| agent.scenarios().is_empty()).await;
}

#[tokio::test]
async fn test_orchestrator_survives_unknown_commands() {
    let bus = Arc::new(LocalBus::new());
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    orchestrator.spawn();

    bus.publish(lorhammer::ORCHESTRATOR_TOPIC, br#"{"cmd":"REBOOT","payload":{}}"#.to_vec())
        .await
        .unwrap();
    bus.publish(lorhammer::ORCHESTRATOR_TOPIC, b"not json".to_vec()).await.unwrap();

    let mut agent = bus.subscribe("/lorhammer/late");
    let announce = NewLorhammer { callback_topic: "/lorhammer/late".to_string() };
    bus.send(lorhammer::ORCHESTRATOR_TOPIC, &Command::new(CommandName::NewLorhammer, &announce).unwrap())
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), agent.recv()).await.unwrap().unwrap();
    assert_eq!(Command::decode(&reply).unwrap().name().unwrap(), CommandName::LorhammerAdded);
    assert_eq!(orchestrator.fleet().len(), 1);
}

#[tokio::test]
async fn test_runner_writes_report_and_shuts_fleet_down() {
    let network = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = network.local_addr().unwrap().to_string();
    let ns = tokio::spawn(async move { serve_network(&network, Duration::from_secs(2)).await });

    let bus = Arc::new(LocalBus::new());
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    orchestrator.spawn();
    let deployer = Arc::new(LocalDeployer::new(bus.clone(), fast_agent_config()));

    let report_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    let config = TestConfig {
        test_type: TestType::OneShot,
        test_duration: "400ms".to_string(),
        min_agents: 2,
        fleet_wait: "5s".to_string(),
        init: Init { description: "two agents".to_string(), ..one_gateway_init(&address) },
        shutdown_all_at_end: true,
        report_path: report_file.path().to_string_lossy().into_owned(),
        deployer: DeployerKind::Local,
        local_agents: 2,
        ..TestConfig::default()
    };

    let runner = TestRunner::new(Arc::clone(&orchestrator), deployer.clone()).with_checker(Arc::new(NoneChecker));
    let report = runner.run(&config).await.unwrap();
    assert_eq!(report.agents, 2);
    assert_eq!(report.scenarios, 2);

    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(report_file.path()).unwrap()).unwrap();
    assert_eq!(written["testType"], "oneShot");
    assert_eq!(written["agents"], 2);
    assert_eq!(written["description"], "two agents");
    assert!(written["errors"].as_array().unwrap().is_empty());

    for agent in deployer.agents() {
        let token = agent.shutdown_token();
        wait_until(|| token.is_cancelled()).await;
        assert!(agent.scenarios().is_empty());
    }

    let seen = ns.await.unwrap();
    assert_eq!(seen.iter().filter(|&&k| k == packet_type::PUSH_DATA).count(), 2);
}

#[tokio::test]
async fn test_remote_hammer_runs_scenario_and_obeys_shutdown() {
    let network = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let broker_address = broker.local_addr().unwrap().to_string();
    let orchestrator = Orchestrator::new(Arc::new(broker.bus()), Arc::new(NoneProvisioner));
    broker.spawn();
    orchestrator.spawn();

    let remote = Arc::new(TcpBus::connect(&broker_address).await.unwrap());
    let agent = Agent::new(remote, &fast_agent_config()).unwrap();
    let serving = agent.spawn();
    wait_until(|| agent.is_registered()).await;
    assert_eq!(orchestrator.fleet().len(), 1);

    let init = one_gateway_init(&network.local_addr().unwrap().to_string());
    orchestrator.init_all(&init).await.unwrap();
    let seen = serve_network(&network, Duration::from_millis(500)).await;
    assert_eq!(seen.iter().filter(|&&k| k == packet_type::PUSH_DATA).count(), 1);
    assert_eq!(agent.stats().acked, 1);

    orchestrator.shutdown_all().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), serving).await.unwrap().unwrap();
    assert!(agent.shutdown_token().is_cancelled());
    wait_until(|| agent.scenarios().is_empty()).await;
}

#[tokio::test]
async fn test_runner_fails_without_fleet() {
    let bus = Arc::new(LocalBus::new());
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    orchestrator.spawn();

    let config = TestConfig {
        test_type: TestType::None,
        fleet_wait: "100ms".to_string(),
        deployer: DeployerKind::None,
        ..TestConfig::default()
    };
    let runner = TestRunner::new(orchestrator, Arc::new(lorhammer::collaborators::NoneDeployer));
    assert!(runner.run(&config).await.is_err());
}
