//! Deterministic search backend.
//!
//! Replays a fixed list of matches for every dispatch and records what it
//! was asked to search. The firmware stub variant answers every header with
//! nonce 12345 and an all-0xAA hash, which is enough to exercise the wire
//! protocol end to end without hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::{Gateway, GatewayEvent, HardwareError, Match, EVENT_CHANNEL_CAPACITY};
use crate::protocol::HeaderBuffer;

/// Nonce reported by the firmware stub.
pub const STUB_NONCE: u32 = 12345;

/// Hash word reported by the firmware stub.
pub const STUB_HASH_WORD: u32 = 0xaaaa_aaaa;

/// A recorded dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub struct Dispatched {
    pub header: HeaderBuffer,
    pub target_bits: u32,
}

/// How a dispatched search ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))] // failure modes are scripted by tests only
enum Ending {
    /// Send the end marker.
    Exhausted,
    /// Report a failure after the matches.
    Failed,
    /// Never finish; hold the channel open until the session goes away.
    Stall,
    /// Refuse the dispatch.
    RejectDispatch,
}

pub struct MockGateway {
    matches: Vec<Match>,
    ending: Ending,
    gate: Option<Arc<Semaphore>>,
    dispatched: Mutex<Vec<Dispatched>>,
    resets: AtomicUsize,
}

impl MockGateway {
    /// Replay `matches` for every dispatch, then end the stream.
    pub fn new(matches: Vec<Match>) -> Self {
        Self::with_ending(matches, Ending::Exhausted)
    }

    /// One fixed result per request.
    pub fn firmware_stub() -> Self {
        Self::new(vec![Match {
            nonce: STUB_NONCE,
            hash: [STUB_HASH_WORD; 8],
        }])
    }

    fn with_ending(matches: Vec<Match>, ending: Ending) -> Self {
        Self {
            matches,
            ending,
            gate: None,
            dispatched: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        }
    }

    /// Every dispatch fails.
    #[cfg(test)]
    pub fn failing_dispatch() -> Self {
        Self::with_ending(Vec::new(), Ending::RejectDispatch)
    }

    /// Replay `matches`, then report a collection failure.
    #[cfg(test)]
    pub fn failing_collection(matches: Vec<Match>) -> Self {
        Self::with_ending(matches, Ending::Failed)
    }

    /// Never produce anything.
    #[cfg(test)]
    pub fn stalled() -> Self {
        Self::with_ending(Vec::new(), Ending::Stall)
    }

    /// Replay `matches`, then hold the end marker back until the returned
    /// gate is released once for this search.
    #[cfg(test)]
    pub fn gated(matches: Vec<Match>) -> (Self, MockGate) {
        let semaphore = Arc::new(Semaphore::new(0));
        let mut gateway = Self::new(matches);
        gateway.gate = Some(Arc::clone(&semaphore));
        (gateway, MockGate { semaphore })
    }

    /// Number of searches started so far.
    #[cfg(test)]
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Headers dispatched so far, oldest first.
    #[cfg(test)]
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }
}

impl Gateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn reset(&self) -> Result<(), HardwareError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dispatch(
        &self,
        header: HeaderBuffer,
        target_bits: u32,
    ) -> Result<mpsc::Receiver<GatewayEvent>, HardwareError> {
        if self.ending == Ending::RejectDispatch {
            return Err(HardwareError::DispatchFailed(
                "mock refused the work".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HardwareError::DispatchFailed(e.to_string()))?;

        debug!(?header, target_bits, "Mock search dispatched");
        if let Ok(mut dispatched) = self.dispatched.lock() {
            dispatched.push(Dispatched {
                header,
                target_bits,
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let matches = self.matches.clone();
        let ending = self.ending;
        let gate = self.gate.clone();

        runtime.spawn(async move {
            for found in matches {
                if tx.send(GatewayEvent::Found(found)).await.is_err() {
                    return;
                }
            }

            if let Some(gate) = gate {
                tokio::select! {
                    permit = gate.acquire() => match permit {
                        Ok(permit) => permit.forget(),
                        Err(_) => return,
                    },
                    _ = tx.closed() => return,
                }
            }

            match ending {
                Ending::Exhausted => {
                    let _ = tx.send(GatewayEvent::Exhausted).await;
                }
                Ending::Failed => {
                    let _ = tx
                        .send(GatewayEvent::Failed("mock unit fault".to_string()))
                        .await;
                }
                Ending::Stall => tx.closed().await,
                Ending::RejectDispatch => {}
            }
        });

        Ok(rx)
    }
}

/// Releases gated mock searches, one per call.
#[cfg(test)]
pub struct MockGate {
    semaphore: Arc<Semaphore>,
}

#[cfg(test)]
impl MockGate {
    pub fn release(&self) {
        self.semaphore.add_permits(1);
    }
}
