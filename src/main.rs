//! NX9 DNS Relay
//!
//! A caching DNS relay with domain blocking. Address queries are answered
//! from the cache when possible; everything else goes to the upstream.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::{error, info, warn};
use tokio::{signal, task};

use nx9_dns_relay::{
    cache::{open_cache, CACHE_CLEANUP_INTERVAL},
    config::{CliOverrides, ServerConfig},
    errors::DnsError,
    handlers::run_udp_server,
    resolver::DnsRelay,
    seed::load_seed_file,
    upstream::UdpForwarder,
};

#[derive(Parser)]
#[command(name = "nx9-dns-relay")]
#[command(version)]
#[command(about = "Caching DNS relay with domain blocking")]
struct Cli {
    /// Cache engine to use (memory or sqlite)
    #[arg(long, value_name = "ENGINE")]
    cache: Option<String>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Upstream resolver, `ip` or `ip:port`
    #[arg(long)]
    upstream: Option<String>,

    /// Seed file of `<ipv4> <name>...` lines
    #[arg(long, value_name = "FILE")]
    seed_file: Option<PathBuf>,

    /// SQLite cache database path
    #[arg(long, value_name = "FILE")]
    db_path: Option<String>,
}

impl From<Cli> for CliOverrides {
    fn from(cli: Cli) -> Self {
        Self {
            cache_engine: cli.cache,
            host: cli.host,
            port: cli.port,
            log_level: cli.log_level,
            upstream: cli.upstream,
            seed_file: cli.seed_file,
            db_path: cli.db_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), DnsError> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env().and_then(|config| config.with_overrides(cli.into()));

    // Initialize the logger before reporting a bad configuration
    let level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".into());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_micros()
        .init();

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

async fn run(config: ServerConfig) -> Result<(), DnsError> {
    info!(
        "Starting relay: upstream {}, cache {:?}",
        config.upstream, config.cache_engine
    );

    let cache = open_cache(&config)?;
    if let Some(path) = &config.seed_file {
        load_seed_file(path, cache.as_ref())?;
    }

    // Set up cache cleanup task
    let cache_cleanup = task::spawn({
        let cache = cache.clone();
        async move {
            let mut interval = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = cache.purge_expired() {
                    warn!("Cache cleanup failed: {}", e);
                }
            }
        }
    });

    let relay = Arc::new(DnsRelay::new(cache, UdpForwarder::from_config(&config)));

    // Wait for either a shutdown signal or server error
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Shutdown signal received");
            cache_cleanup.abort();
            Ok(())
        },
        res = run_udp_server(config, relay) => res,
    }
}
