use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging system for the AgentMesh node
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log level based on debug/release build
        if cfg!(debug_assertions) {
            EnvFilter::new("agentmesh=debug,libp2p=info")
        } else {
            EnvFilter::new("agentmesh=info,libp2p=warn")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("AgentMesh logging initialized");
    Ok(())
}

/// Initialize logging with fallback behavior if setup fails
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!(
            "Warning: Failed to set up advanced logging: {}. Using basic logging.",
            e
        );
    }
}

/// Log network events
pub fn log_network_event(event: &str, details: &str) {
    info!(target: "mesh::network", "{}: {}", event, details);
}

/// Log descriptor publish/resolve operations
pub fn log_descriptor_operation(operation: &str, cid: &str, details: &str) {
    info!(target: "mesh::descriptor", "{} {}: {}", operation, cid, details);
}

/// Log error with context
pub fn log_error_with_context(context: &str, error: &dyn std::error::Error) {
    error!(target: "mesh::error", "{}: {}", context, error);
}
