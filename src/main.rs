// ===================================================================================================
// AgentMesh - Peer-to-Peer Networking Node for a Decentralized Agent Marketplace
// ===================================================================================================
//
// Binary entry point. Parses the CLI, loads configuration, constructs a node and executes the
// requested command. All of the actual behavior lives in the library crate; this file only
// translates commands into node operations.

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use agentmesh::cli::{Cli, Commands};
use agentmesh::config::MeshConfig;
use agentmesh::logging;
use agentmesh::Node;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging_safe();

    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let path = output
            .clone()
            .or_else(MeshConfig::default_path)
            .ok_or_else(|| anyhow::anyhow!("no output path for configuration"))?;
        MeshConfig::default().save(&path)?;
        println!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config_path = cli.config.clone().or_else(MeshConfig::default_path);
    let mut config = MeshConfig::load_or_default(config_path)?;
    cli.apply_to(&mut config);

    let node = Node::new(config).await?;
    info!("node {} ({})", node.peer_id(), node.did());
    node.bootstrap().await?;

    match &cli.command {
        Commands::Run => {
            for address in node.listen_addresses().await? {
                println!("listening on {}/p2p/{}", address, node.peer_id());
            }
            println!("node running; ctrl-c to stop");
            signal::ctrl_c().await?;
        }

        Commands::Publish { path, signed } => {
            let bytes = std::fs::read(path)?;
            let cid = if *signed {
                let envelope = node.sign_descriptor(&bytes)?;
                node.publish(&serde_json::to_vec(&envelope)?).await?
            } else {
                node.publish(&bytes).await?
            };
            println!("{}", cid);
            // Stay up briefly so provider records propagate.
            signal::ctrl_c().await?;
        }

        Commands::Resolve { cid, output } => {
            let bytes = node.resolve(cid).await?;
            match output {
                Some(path) => {
                    std::fs::write(path, &bytes)?;
                    println!("wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => {
                    println!("{}", String::from_utf8_lossy(&bytes));
                }
            }
        }

        Commands::Config { .. } => unreachable!("handled above"),
    }

    node.close().await;
    Ok(())
}
