// AgentMesh - Main Entry Point
//
// Runs one agent endpoint on the private mesh:
// - CLI interface
// - Configuration and logging setup
// - Mesh lifecycle until Ctrl+C

use agentmesh::config::Config;
use agentmesh::logging::LogLevel;
use agentmesh::mesh::{MeshProtocol, WILDCARD};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// AgentMesh: Private encrypted mesh for local agents
#[derive(Parser, Debug)]
#[command(name = "agentmesh")]
#[command(author = "AgentMesh Contributors")]
#[command(version)]
#[command(about = "Encrypted peer-to-peer mesh for agents on a local network", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "agentmesh.toml")]
    config: PathBuf,

    /// Mesh command to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join the mesh and log every message received
    Run {
        /// Agent role announced to peers
        #[arg(long)]
        role: Option<String>,

        /// Device name announced to peers
        #[arg(long)]
        device: Option<String>,

        /// Seconds between peer summaries
        #[arg(long, default_value_t = 30)]
        report_interval: u64,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Generate a fresh mesh identity and print it
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config)?;

    // Initialize tracing
    if args.verbose {
        config.logging.level = LogLevel::Debug;
    }
    config.logging.init()?;

    info!("AgentMesh v{} starting...", env!("CARGO_PKG_VERSION"));

    match args.command {
        Some(Commands::Run {
            role,
            device,
            report_interval,
        }) => {
            if let Some(role) = role {
                config.mesh.agent_role = role;
            }
            if let Some(device) = device {
                config.mesh.device_name = device;
            }
            run_mesh(config, Duration::from_secs(report_interval.max(1))).await?;
        }
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
        }
        Some(Commands::Identity) => {
            let mesh = MeshProtocol::new(config.mesh).context("Failed to create mesh identity")?;
            println!("mesh_id: {}", mesh.mesh_id());
            println!("agent_role: {}", mesh.agent_role());
            println!("public_key: {}", hex::encode(mesh.public_key()));
        }
        None => {
            info!("No command specified. Use \"agentmesh --help\" for usage.");
        }
    }

    Ok(())
}

/// Join the mesh until Ctrl+C
async fn run_mesh(config: Config, report_interval: Duration) -> Result<()> {
    let mesh = MeshProtocol::new(config.mesh).context("Failed to create mesh protocol")?;

    mesh.on_message(WILDCARD, |message, peer| {
        info!(
            "📨 {} from {} ({}, {}): {} bytes",
            message.message_type,
            peer.id,
            peer.agent_role,
            peer.ip_address,
            message.payload.len()
        );
        Ok(())
    });

    mesh.start().await.context("Failed to start mesh")?;
    info!("🕸️  Joined mesh as {} ({})", mesh.mesh_id(), mesh.agent_role());

    let mut report = tokio::time::interval(report_interval);
    report.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, leaving mesh...");
                break;
            }
            _ = report.tick() => {
                let peers = mesh.get_peers(None);
                let stats = mesh.get_stats();
                info!(
                    "{} peer(s) known, {} sent, {} received, {} dropped",
                    peers.len(),
                    stats.messages_sent,
                    stats.messages_received,
                    stats.messages_dropped
                );
                for peer in peers {
                    info!("  {} {} @ {} ({})", peer.id, peer.agent_role, peer.socket_addr(), peer.device_name);
                }
            }
        }
    }

    mesh.stop().await;
    Ok(())
}
