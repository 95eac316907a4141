//! CLI commands for the overlay
//!
//! Implements the command handlers behind the `overlay` binary.

use crate::config::{parse_host_port, OverlayConfig};
use crate::network::{Node, NodeServices};
use crate::registry::{JsonPeerRegistry, PeerRegistry, REGISTRY_FILE};
use std::path::{Path, PathBuf};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Command-line overrides for `start`
#[derive(Debug, Default, Clone)]
pub struct StartOptions {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub name: Option<String>,
    /// Comma-separated `host:port` list
    pub peers: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Configuration file (or defaults) with command-line overrides applied
pub fn resolve_config(options: &StartOptions) -> CliResult<OverlayConfig> {
    let mut config = match &options.config {
        Some(path) => OverlayConfig::load(path)?,
        None => OverlayConfig::default(),
    };

    if let Some(port) = options.port {
        config.port = port;
    }
    if let Some(name) = &options.name {
        config.name = name.clone();
    }
    if let Some(peers) = &options.peers {
        config.bootstrap_peers = peers
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(data_dir) = &options.data_dir {
        config.data_dir = data_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Run a node on TCP until Ctrl-C
pub fn cmd_start(config: OverlayConfig) -> CliResult<()> {
    if !config.enabled {
        log::info!("Overlay disabled in configuration; not starting");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.pool_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let services = NodeServices::persistent(&config.data_dir)?;
        let node = Node::tcp(config, services).await?;
        let addr = node.start().await?;

        println!("🌐 Overlay node {} listening on {}", node.local().peer_id, addr);
        println!("   Press Ctrl+C to stop");

        tokio::signal::ctrl_c().await?;
        println!("\n📴 Shutting down node...");
        node.shutdown().await;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })
}

/// Load, validate and print a configuration file
pub fn cmd_check_config(path: &Path) -> CliResult<()> {
    let config = OverlayConfig::load(path)?;

    println!("✅ Configuration OK: {}", path.display());
    println!("   ├─ Enabled: {}", config.enabled);
    println!("   ├─ Listen: {}:{}", config.advertise_host, config.port);
    println!("   ├─ Name: {}", config.name);
    println!(
        "   ├─ Heartbeat: every {}ms, timeout {}ms",
        config.heartbeat_interval_ms, config.heartbeat_timeout_ms
    );
    println!("   ├─ Discovery: every {}ms", config.discovery_interval_ms);
    println!("   ├─ Reconciliation: every {}ms", config.reconciliation_interval_ms);
    println!("   ├─ Anti-entropy: every {}ms", config.sync_interval_ms);
    println!(
        "   ├─ Timeouts: client {}ms, write {}ms",
        config.client_timeout_ms, config.write_timeout_ms
    );
    println!(
        "   ├─ Retries: {} x {}ms, {} worker thread(s)",
        config.retry_attempts, config.retry_delay_ms, config.pool_threads
    );
    for peer in &config.bootstrap_peers {
        let (host, port) = parse_host_port(peer)?;
        println!("   ├─ Bootstrap: {}:{}", host, port);
    }
    println!("   └─ Data dir: {}", config.data_dir.display());

    Ok(())
}

/// List the durable peer directory
pub fn cmd_peers(data_dir: &Path) -> CliResult<()> {
    if !data_dir.join(REGISTRY_FILE).exists() {
        println!("📭 No peer directory at {}", data_dir.display());
        return Ok(());
    }

    let registry = JsonPeerRegistry::open(data_dir)?;
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let mut peers = runtime.block_on(registry.find_all())?;
    peers.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!("👥 Known peers ({}):", peers.len());
    for peer in peers {
        let last_seen = peer
            .ultimo_latido
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "   {} | {:<7} | {}:{} | {} | last heartbeat {}",
            peer.peer_id, peer.estado, peer.ip, peer.puerto, peer.nombre_servidor, last_seen
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_overrides_apply_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(&path, r#"{"port": 23000, "name": "from-file"}"#).unwrap();

        let options = StartOptions {
            config: Some(path),
            name: Some("from-cli".to_string()),
            peers: Some("10.0.0.1:22200, 10.0.0.2:22201,".to_string()),
            ..Default::default()
        };
        let config = resolve_config(&options).unwrap();

        assert_eq!(config.port, 23000);
        assert_eq!(config.name, "from-cli");
        assert_eq!(config.bootstrap_peers, vec!["10.0.0.1:22200", "10.0.0.2:22201"]);
    }

    #[test]
    fn test_bad_override_rejected() {
        let options = StartOptions {
            peers: Some("no-port-here".to_string()),
            ..Default::default()
        };
        assert!(resolve_config(&options).is_err());
    }

    #[test]
    fn test_peers_without_directory() {
        let dir = tempdir().unwrap();
        assert!(cmd_peers(&dir.path().join("missing")).is_ok());
    }
}
