//! TCP listener for sampler connections.
//!
//! Accepts connections and runs each exchange on its own task. Exchanges
//! only contend for the search hardware, never for the accept loop.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connection::{handle_connection, ExchangeSettings, TransportError};
use crate::gateway::Hardware;

/// Server instance
pub struct Server {
    listen: String,
    settings: ExchangeSettings,
    hardware: Arc<Hardware>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config, hardware: Arc<Hardware>) -> Self {
        Server {
            listen: config.listen.clone(),
            settings: ExchangeSettings {
                trailing_data: config.trailing_data,
                read_timeout: config.read_timeout,
            },
            hardware,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Bind the configured address and serve until the process exits.
    ///
    /// Failing to bind is the only error; accept failures are logged and
    /// the loop keeps going.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|source| TransportError::BindFailed {
                addr: self.listen.clone(),
                source,
            })?;
        info!(
            address = %self.listen,
            backend = self.hardware.name(),
            "Server listening"
        );

        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            // Wait for a connection slot
            let Ok(permit) = Arc::clone(&self.connection_limit).acquire_owned().await else {
                return;
            };

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let hardware = Arc::clone(&self.hardware);
                    let settings = self.settings;

                    tokio::spawn(async move {
                        handle_connection(stream, peer, hardware, settings).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    let e = TransportError::AcceptFailed(e);
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}
