//! Lorhammer CLI
//!
//! - `agent`: run one scenario straight against a network server, no bus
//! - `hammer`: fleet agent driven by an orchestrator's command broker
//! - `run`: orchestrator plus local fleet executing one test, optionally
//!   hosting a broker for remote hammers
//! - `version`

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use lorhammer::collaborators::{Deployer, LocalDeployer, NoneChecker, NoneDeployer, NoneProvisioner};
use lorhammer::config::{load_config, AgentConfig, DeployerKind, TestConfig};
use lorhammer::node::Payload;
use lorhammer::{
    agent, Agent, Broker, Init, LocalBus, Orchestrator, TcpBus, TestRunner, DEFAULT_NS_ADDRESS,
    DEFAULT_RECEIVE_TIMEOUT,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "lorhammer")]
#[command(version)]
#[command(about = "LoRaWAN network server load generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay one scenario against a network server until laps complete or Ctrl-C
    Agent {
        #[arg(long, default_value = DEFAULT_NS_ADDRESS)]
        ns_address: String,
        #[arg(long, default_value_t = 1)]
        nb_gateway: usize,
        #[arg(long, default_value_t = 1)]
        min_nb_node: usize,
        #[arg(long, default_value_t = 1)]
        max_nb_node: usize,
        #[arg(long, default_value = DEFAULT_RECEIVE_TIMEOUT)]
        receive_timeout: String,
        #[arg(long, default_value = "10s")]
        scenario_sleep: String,
        #[arg(long, default_value = "100ms")]
        gateway_sleep: String,
        /// Send join requests before the first round
        #[arg(long)]
        with_join: bool,
        /// Hex payloads replayed in order; repeat the flag for several
        #[arg(long = "payload")]
        payloads: Vec<String>,
        /// Stop after this many payload laps (0: never)
        #[arg(long, default_value_t = 0)]
        laps: i32,
    },

    /// Join an orchestrator's fleet and serve its commands until SHUTDOWN or Ctrl-C
    Hammer {
        /// Command broker address, as given to `run --listen`
        #[arg(long)]
        broker: String,
        #[arg(long)]
        agent_config: Option<String>,
    },

    /// Run one orchestrated test with an in-process fleet
    Run {
        #[arg(short, long, default_value = "lorhammer.toml")]
        config: String,
        /// Agent settings for locally deployed agents
        #[arg(long)]
        agent_config: Option<String>,
        /// Accept remote hammers on this address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Show version information
    Version,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            let version = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            });
            println!("{}", serde_json::to_string_pretty(&version)?);
        }
        Commands::Agent {
            ns_address,
            nb_gateway,
            min_nb_node,
            max_nb_node,
            receive_timeout,
            scenario_sleep,
            gateway_sleep,
            with_join,
            payloads,
            laps,
        } => {
            let init = Init {
                ns_address,
                nb_gateway,
                nb_node: [min_nb_node, max_nb_node],
                scenario_sleep_time: [scenario_sleep.clone(), scenario_sleep],
                gateway_sleep_time: [gateway_sleep.clone(), gateway_sleep],
                with_join,
                payloads: payloads.into_iter().map(|value| Payload::new(value, None)).collect(),
                receive_timeout_time: receive_timeout,
                nb_scenario_replay_laps: laps,
                ..Init::default()
            };
            let shutdown = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

            let totals = agent::run_standalone(&init, shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&totals)?);
        }
        Commands::Hammer { broker, agent_config } => {
            let totals = run_hammer(&broker, load_agent_config(agent_config)?).await?;
            println!("{}", serde_json::to_string_pretty(&totals)?);
        }
        Commands::Run { config, agent_config, listen } => {
            let config: TestConfig = load_config(&config)?;
            run_test(config, load_agent_config(agent_config)?, listen).await?;
        }
    }

    Ok(())
}

fn load_agent_config(path: Option<String>) -> lorhammer::Result<AgentConfig> {
    match path {
        Some(path) => load_config(&path),
        None => Ok(AgentConfig::default()),
    }
}

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

async fn cancel_on_ctrl_c(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Interrupted, stopping");
            token.cancel();
        }
        Err(e) => log::error!("Cannot listen for Ctrl-C: {}", e),
    }
}

async fn run_hammer(broker: &str, config: AgentConfig) -> lorhammer::Result<lorhammer::StatsSnapshot> {
    let bus = Arc::new(TcpBus::connect(broker).await?);
    let closed = bus.closed();
    let agent = Agent::new(bus, &config)?;
    let serving = agent.spawn();
    let shutdown = agent.shutdown_token();

    tokio::select! {
        _ = shutdown.cancelled() => log::info!("Hammer {} shut down by orchestrator", agent.id()),
        _ = closed.cancelled() => log::warn!("Hammer {} lost its command broker", agent.id()),
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted, stopping hammer {}", agent.id()),
    }

    agent.stop_all();
    agent.settle().await;
    serving.abort();
    Ok(agent.stats())
}

async fn run_test(config: TestConfig, agent_config: AgentConfig, listen: Option<String>) -> lorhammer::Result<()> {
    let bus = match listen {
        Some(address) => {
            let broker = Broker::bind(&address).await?;
            log::info!("Hammers can join on {}", broker.local_addr()?);
            let bus = broker.bus();
            broker.spawn();
            Arc::new(bus)
        }
        None => Arc::new(LocalBus::new()),
    };
    let orchestrator = Orchestrator::new(bus.clone(), Arc::new(NoneProvisioner));
    let serving = orchestrator.spawn();

    let local = Arc::new(LocalDeployer::new(bus.clone(), agent_config));
    let deployer: Arc<dyn Deployer> = match config.deployer {
        DeployerKind::Local => local.clone(),
        DeployerKind::None => Arc::new(NoneDeployer),
    };

    let runner = TestRunner::new(Arc::clone(&orchestrator), deployer).with_checker(Arc::new(NoneChecker));
    let outcome = tokio::select! {
        outcome = runner.run(&config) => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, stopping fleet");
            orchestrator.stop_all().await?;
            local.teardown();
            serving.abort();
            return Ok(());
        }
    };

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if config.shutdown_all_at_end && !local.wait_for_shutdown(SHUTDOWN_WAIT).await {
        log::warn!("Some local agents did not acknowledge SHUTDOWN within {:?}", SHUTDOWN_WAIT);
    }
    for totals in local.agent_stats() {
        println!("{}", serde_json::to_string_pretty(&totals)?);
    }
    local.teardown();
    serving.abort();
    Ok(())
}
