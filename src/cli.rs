/// Command Line Interface Module
///
/// Command parsing for the AgentMesh node binary using clap. The binary
/// supports the following commands:
/// - run: Run a long-lived mesh node
/// - publish: Publish a descriptor file and print its CID
/// - resolve: Resolve a CID from the mesh and print or save the bytes
/// - config: Write a default configuration file
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Main CLI structure for the AgentMesh node
#[derive(Parser, Debug, Clone)]
#[command(name = "agentmesh", about = "Peer-to-peer networking node for the agent marketplace")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen multiaddrs, overriding the configuration
    #[arg(long)]
    pub listen: Vec<String>,

    /// Bootstrap peers as <multiaddr>/p2p/<peer-id>, overriding the configuration
    #[arg(long)]
    pub bootstrap_peer: Vec<String>,

    /// Enable the Kademlia DHT in server mode
    #[arg(long)]
    pub dht_server: bool,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for the AgentMesh node
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a long-lived mesh node
    Run,

    /// Publish a descriptor file and print its CID
    Publish {
        /// Path of the descriptor bytes to publish
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Sign the descriptor with the node key and publish the envelope
        #[arg(long)]
        signed: bool,
    },

    /// Resolve a CID from the mesh
    Resolve {
        /// The content identifier to resolve
        #[arg(value_name = "CID")]
        cid: String,

        /// Write the resolved bytes to a file instead of stdout
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Write a default configuration file
    Config {
        /// Destination path for the generated configuration
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

impl Cli {
    /// Fold CLI overrides into a loaded configuration.
    pub fn apply_to(&self, config: &mut crate::config::MeshConfig) {
        if !self.listen.is_empty() {
            config.network.listen_addresses = self.listen.clone();
        }
        if !self.bootstrap_peer.is_empty() {
            config.network.bootstrap_peers = self.bootstrap_peer.clone();
        }
        if self.dht_server {
            config.dht.enabled = true;
            config.dht.server_mode = true;
        }
    }
}
