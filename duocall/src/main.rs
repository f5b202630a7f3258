mod scenario;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::info;

use duocall_core::peer::{MemoryPeerConnectionFactory, WebRtcPeerConnectionFactory};
use duocall_core::{logging, Config, PeerConnectionFactory, RoomId};

use scenario::{Runner, Scenario};

/// Peer connection engine backing both participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// In-process engine exchanging synthetic descriptions
    Memory,
    /// webrtc-rs peer connections with real SDP and ICE gathering
    Webrtc,
}

/// Two participants calling each other through an in-memory relay
#[derive(Debug, Parser)]
#[command(name = "duocall", version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DUOCALL_CONFIG_FILE")]
    config: Option<String>,

    /// Room both participants join
    #[arg(long, default_value = "42")]
    room: String,

    #[arg(long, value_enum, default_value_t = Engine::Memory)]
    engine: Engine,

    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(room_id = %cli.room, engine = ?cli.engine, scenario = ?cli.scenario, "duocall starting");

    // 4. Pick the peer connection engine
    let factory: Arc<dyn PeerConnectionFactory> = match cli.engine {
        Engine::Memory => Arc::new(MemoryPeerConnectionFactory),
        Engine::Webrtc => Arc::new(WebRtcPeerConnectionFactory::new(config.webrtc.clone())),
    };

    // 5. Walk the scenarios
    let runner = Runner::new(config, factory, RoomId::from(cli.room));
    for scenario in cli.scenario.expand() {
        let report = runner.run(scenario).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!("duocall finished");
    Ok(())
}
