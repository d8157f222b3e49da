use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};

/// Configuration for an AgentMesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Transport and overlay configuration
    pub network: NetworkConfig,
    /// Kademlia DHT configuration
    pub dht: DhtConfig,
    /// Protocol version negotiation
    pub protocol: ProtocolConfig,
    /// Peer heartbeat failure detector
    pub health: HealthConfig,
    /// Connection/stream pool sizing
    pub pool: PoolConfig,
    /// Token bucket and send window limits
    pub flow: FlowConfig,
    /// Bandwidth accounting and priority queuing
    pub bandwidth: BandwidthConfig,
    /// Single-flight request cache
    pub dedup: DedupConfig,
    /// Provider record republishing
    pub provider: ProviderConfig,
    /// Signed descriptor acceptance window
    pub descriptor: DescriptorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multiaddrs the transport binds to
    pub listen_addresses: Vec<String>,
    /// Bootstrap peers dialed on startup, `<multiaddr>/p2p/<peer-id>` form
    pub bootstrap_peers: Vec<String>,
    /// Enable mDNS LAN rendezvous
    pub lan_discovery: bool,
    /// Idle connection timeout for the swarm
    pub idle_connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Enable the Kademlia DHT
    pub enabled: bool,
    /// Run as a DHT server (answer queries) instead of client
    pub server_mode: bool,
    /// TTL applied to provider records we publish
    pub provider_ttl_secs: u64,
    /// Deadline for provider lookups
    pub lookup_timeout_secs: u64,
    /// Maximum provider candidates collected per lookup
    pub max_providers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Version advertised in handshakes and protocol ids
    pub version: String,
    /// Oldest peer version we accept
    pub min_compatible_version: String,
    /// Features this node advertises
    pub features: Vec<String>,
    /// Features a peer must advertise to be accepted
    pub required_features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between heartbeat checks in seconds
    pub heartbeat_secs: u64,
    /// Consecutive failures before a peer is marked unhealthy
    pub failure_threshold: u32,
    /// Per-check timeout in seconds
    pub check_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle time before a pooled connection is closed, in seconds
    pub max_idle_secs: u64,
    /// Maximum idle streams kept per connection
    pub max_streams_per_conn: usize,
    /// Interval of the idle sweep in seconds
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Global send rate in bytes per second
    pub global_rate: u64,
    /// Per-peer send rate in bytes per second
    pub per_peer_rate: u64,
    /// Token bucket capacity in bytes
    pub bucket_capacity: u64,
    /// Maximum in-flight messages per peer
    pub window_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Per-peer bandwidth limit in bytes per second
    pub limit: u64,
    /// Burst allowance in bytes
    pub burst: u64,
    /// Token refill interval in milliseconds
    pub refill_interval_ms: u64,
    /// Per-priority queue depth
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Cached result time-to-live in seconds
    pub ttl_secs: u64,
    /// Maximum cached entries before eviction
    pub max_size: usize,
    /// Expired-entry sweep interval in seconds
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Republish interval in seconds
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// Maximum accepted envelope age in seconds
    pub max_age_secs: u64,
    /// Tolerated future clock skew in seconds
    pub max_skew_secs: u64,
    /// Short-circuit signature verification. Logs a warning; never the default.
    pub auth_disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable structured logging
    pub structured: bool,
    /// Log to file
    pub log_file: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                listen_addresses: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
                bootstrap_peers: vec![],
                lan_discovery: false,
                idle_connection_timeout_secs: 120,
            },
            dht: DhtConfig {
                enabled: false,
                server_mode: false,
                provider_ttl_secs: 24 * 60 * 60,
                lookup_timeout_secs: 10,
                max_providers: 5,
            },
            protocol: ProtocolConfig {
                version: "1.0.0".to_string(),
                min_compatible_version: "1.0.0".to_string(),
                features: vec!["content-exchange".to_string(), "qrouting".to_string()],
                required_features: vec![],
            },
            health: HealthConfig {
                heartbeat_secs: 30,
                failure_threshold: 3,
                check_timeout_secs: 5,
            },
            pool: PoolConfig {
                max_idle_secs: 5 * 60,
                max_streams_per_conn: 10,
                cleanup_interval_secs: 60,
            },
            flow: FlowConfig {
                global_rate: 10 * 1024 * 1024,     // 10 MB/s
                per_peer_rate: 1024 * 1024,        // 1 MB/s
                bucket_capacity: 5 * 1024 * 1024,  // 5 MB
                window_size: 256,
            },
            bandwidth: BandwidthConfig {
                limit: 1024 * 1024,       // 1 MB/s
                burst: 10 * 1024 * 1024,  // 10 MB
                refill_interval_ms: 100,
                queue_depth: 1000,
            },
            dedup: DedupConfig {
                ttl_secs: 5 * 60,
                max_size: 1000,
                cleanup_interval_secs: 60,
            },
            provider: ProviderConfig {
                refresh_interval_secs: 12 * 60 * 60,
            },
            descriptor: DescriptorConfig {
                max_age_secs: 60 * 60,
                max_skew_secs: 5 * 60,
                auth_disabled: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                structured: true,
                log_file: None,
            },
        }
    }
}

impl MeshConfig {
    /// Load configuration from file, falling back to defaults
    pub fn load_or_default(config_path: Option<PathBuf>) -> MeshResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: MeshConfig = toml::from_str(&config_str)
                    .map_err(|e| MeshError::Config(format!("Config parse error: {}", e)))?;
                tracing::info!("Loaded configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("Using default configuration");
        Ok(MeshConfig::default())
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &PathBuf) -> MeshResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Config serialize error: {}", e)))?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Default location for the node configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("agentmesh").join("config.toml"))
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.network.idle_connection_timeout_secs)
    }

    pub fn dht_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.dht.lookup_timeout_secs)
    }
}
