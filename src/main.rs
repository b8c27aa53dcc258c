//! asic-sampler: seed-driven hash search server
//!
//! Clients send a 256-bit seed and a compact difficulty target; the seed is
//! injected into an 80-byte block-style header, the header is searched by
//! the hash hardware, and every nonce found below the target is returned
//! with its hash.
//!
//! Features:
//! - Fixed-size little-endian request/result frames, one exchange per connection
//! - Exclusive, timed access to the search hardware
//! - Software (double SHA-256) and mock search backends
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod gateway;
mod protocol;
mod server;

use std::sync::Arc;

use config::{BackendType, Config};
use gateway::{Gateway, Hardware, MockGateway, SoftwareGateway};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        chains = config.topology.chains,
        chips_per_chain = config.topology.chips_per_chain,
        collect_timeout_ms = config.collect_timeout.as_millis() as u64,
        trailing_data = ?config.trailing_data,
        "Starting asic-sampler"
    );

    let gateway: Arc<dyn Gateway> = match config.backend {
        BackendType::Software => Arc::new(SoftwareGateway::new(
            config.topology,
            config.nonce_limit,
            config.max_results,
        )),
        BackendType::Mock => Arc::new(MockGateway::firmware_stub()),
    };
    let hardware = Arc::new(Hardware::new(gateway, config.collect_timeout));

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(async {
        // Hardware must be in a known state before the first connection
        hardware.reset()?;
        Server::new(&config, hardware).run().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
