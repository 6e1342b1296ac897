//! tidekv server
//!
//! Redis-protocol-compatible in-memory data server with a write-ahead log,
//! snapshots and primary/replica replication.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tidekv_core::config::parse_host_port;
use tidekv_core::{init_logging, Server, ServerConfig};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tidekv-server")]
#[command(about = "tidekv - in-memory data server with WAL durability and replication")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, env = "TIDEKV_CONFIG", default_value = "tidekv.toml")]
    config: PathBuf,

    /// Bind address
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Data directory for the WAL and snapshots
    #[arg(short = 'D', long)]
    dir: Option<PathBuf>,

    /// Replicate from a primary at startup (host:port)
    #[arg(long)]
    replicaof: Option<String>,

    /// Disable the write-ahead log
    #[arg(long)]
    no_wal: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) -> Result<()> {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.dir {
            config.persistence.dir = dir.clone();
        }
        if let Some(target) = &self.replicaof {
            parse_host_port(target).with_context(|| format!("Invalid --replicaof '{}'", target))?;
            config.replication.replicaof = Some(target.clone());
        }
        if self.no_wal {
            config.persistence.wal_enabled = false;
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config)?;
    args.apply(&mut config)?;
    init_logging(&config.logging)?;

    info!("tidekv {} starting", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Listen address: {}", config.bind_address());
    info!("  Data directory: {}", config.persistence.dir.display());
    info!(
        "  WAL: {}",
        if config.persistence.wal_enabled {
            format!("enabled (fsync {:?})", config.persistence.fsync)
        } else {
            "disabled".to_string()
        }
    );
    if let Some(target) = &config.replication.replicaof {
        info!("  Replicating from: {}", target);
    }

    let server = Server::start(config).await?;
    info!("Press Ctrl+C to shut down");

    tokio::select! {
        result = server.run() => result?,
        _ = signal::ctrl_c() => info!("Received shutdown signal, stopping server..."),
    }

    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "tidekv-server",
            "--port",
            "7001",
            "--dir",
            "/tmp/tidekv",
            "--replicaof",
            "10.0.0.1:6379",
            "--no-wal",
            "--debug",
        ]);
        let mut config = ServerConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.server.port, 7001);
        assert_eq!(config.persistence.dir, PathBuf::from("/tmp/tidekv"));
        assert_eq!(config.replication.replicaof.as_deref(), Some("10.0.0.1:6379"));
        assert!(!config.persistence.wal_enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_replicaof_rejected() {
        let args = Args::parse_from(["tidekv-server", "--replicaof", "nohost"]);
        assert!(args.apply(&mut ServerConfig::default()).is_err());
    }
}
