//! Boundary between the protocol core and the search hardware.
//!
//! A [`Gateway`] is the capability a search backend provides: reset the
//! units once at startup, and start a search for a header. Matches stream
//! back over a channel and the stream ends with an explicit
//! [`GatewayEvent::Exhausted`] marker.
//!
//! The physical units are one shared resource, so all access goes through
//! [`Hardware`], which hands out a single [`HardwareLease`] at a time. A
//! lease can run one [`HardwareSession`] at a time; the session tags every
//! match with the request id and enforces the collection timeout.
//!
//! Backends:
//! - `software`: double SHA-256 search on the blocking thread pool
//! - `mock`: deterministic replay, used by tests and as a firmware stub

pub mod mock;
pub mod software;

pub use mock::MockGateway;
pub use software::SoftwareGateway;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{info, trace};

use crate::protocol::{HeaderBuffer, ResultRecord, Words256};

/// Capacity of the per-session event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Hardware errors. None of them leave the units in a state that needs a
/// reset before the next request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("hardware reset failed: {0}")]
    ResetFailed(String),
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("result collection failed: {0}")]
    CollectionFailed(String),
}

/// A nonce the search unit found, before it is tied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub nonce: u32,
    pub hash: Words256,
}

/// Events a search reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Found(Match),
    /// No more results for this header.
    Exhausted,
    /// The search unit gave up.
    Failed(String),
}

/// Physical layout of the search units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub chains: u32,
    pub chips_per_chain: u32,
}

impl Topology {
    /// Total number of search units.
    pub fn units(&self) -> u64 {
        u64::from(self.chains) * u64::from(self.chips_per_chain)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            chains: 3,
            chips_per_chain: 63,
        }
    }
}

/// A search backend.
pub trait Gateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the units to a known state. Called once before serving.
    fn reset(&self) -> Result<(), HardwareError>;

    /// Start searching `header` against `target_bits`.
    ///
    /// Must return as soon as the work is handed off. Results arrive on the
    /// returned channel; dropping the receiver cancels the search.
    fn dispatch(
        &self,
        header: HeaderBuffer,
        target_bits: u32,
    ) -> Result<mpsc::Receiver<GatewayEvent>, HardwareError>;
}

/// Process-wide exclusive handle on the search hardware.
pub struct Hardware {
    gateway: Arc<dyn Gateway>,
    lease: Arc<Mutex<()>>,
    collect_timeout: Duration,
}

impl Hardware {
    pub fn new(gateway: Arc<dyn Gateway>, collect_timeout: Duration) -> Self {
        Self {
            gateway,
            lease: Arc::new(Mutex::new(())),
            collect_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.gateway.name()
    }

    pub fn reset(&self) -> Result<(), HardwareError> {
        info!(backend = self.gateway.name(), "Resetting search hardware");
        self.gateway.reset()
    }

    /// Wait until no other exchange holds the hardware.
    pub async fn acquire(&self) -> HardwareLease {
        let guard = Arc::clone(&self.lease).lock_owned().await;
        HardwareLease {
            gateway: Arc::clone(&self.gateway),
            collect_timeout: self.collect_timeout,
            _guard: guard,
        }
    }
}

/// Exclusive access to the hardware, released on drop.
pub struct HardwareLease {
    gateway: Arc<dyn Gateway>,
    collect_timeout: Duration,
    _guard: OwnedMutexGuard<()>,
}

impl HardwareLease {
    /// Dispatch a header and open the session that collects its results.
    pub fn dispatch(
        &mut self,
        request_id: u32,
        header: HeaderBuffer,
        target_bits: u32,
    ) -> Result<HardwareSession<'_>, HardwareError> {
        let events = self.gateway.dispatch(header, target_bits)?;
        Ok(HardwareSession {
            request_id,
            events,
            collect_timeout: self.collect_timeout,
            finished: false,
            _lease: self,
        })
    }
}

/// Results of one dispatched header.
///
/// Borrows the lease mutably, so a lease never has two sessions open.
/// Dropping the session before it is exhausted cancels the search.
pub struct HardwareSession<'a> {
    request_id: u32,
    events: mpsc::Receiver<GatewayEvent>,
    collect_timeout: Duration,
    finished: bool,
    _lease: &'a mut HardwareLease,
}

impl HardwareSession<'_> {
    /// Next result for this request, or `None` once the hardware has sent
    /// its end marker. Every record carries the id given at dispatch.
    ///
    /// After `None` or an error the session is finished and keeps
    /// returning `None`.
    pub async fn next(&mut self) -> Result<Option<ResultRecord>, HardwareError> {
        if self.finished {
            return Ok(None);
        }

        let event = match tokio::time::timeout(self.collect_timeout, self.events.recv()).await {
            Ok(event) => event,
            Err(_) => {
                self.finished = true;
                return Err(HardwareError::CollectionFailed(format!(
                    "no result within {:?}",
                    self.collect_timeout
                )));
            }
        };

        match event {
            Some(GatewayEvent::Found(found)) => Ok(Some(ResultRecord {
                id: self.request_id,
                nonce: found.nonce,
                hash: found.hash,
            })),
            Some(GatewayEvent::Exhausted) => {
                self.finished = true;
                Ok(None)
            }
            Some(GatewayEvent::Failed(reason)) => {
                self.finished = true;
                Err(HardwareError::CollectionFailed(reason))
            }
            None => {
                self.finished = true;
                Err(HardwareError::CollectionFailed(
                    "search stopped without an end marker".to_string(),
                ))
            }
        }
    }
}

impl Drop for HardwareSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            trace!(id = self.request_id, "Cancelling hardware session");
        }
    }
}
