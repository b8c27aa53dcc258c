//! CPU search backend.
//!
//! Emulates the hash units in software: every nonce in the configured range
//! is written into the header, the header is hashed with double SHA-256 and
//! the digest, read as a little-endian 256-bit integer, is compared against
//! the target expanded from the compact bits. The nonce range is split
//! evenly over the configured units and scanned unit by unit, so matches
//! come out in ascending nonce order.

use sha2::{Digest, Sha256};
use std::ops::Range;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::{Gateway, GatewayEvent, HardwareError, Match, Topology, EVENT_CHANNEL_CAPACITY};
use crate::protocol::{words_from_le_bytes, HeaderBuffer};

/// Full 32-bit nonce space.
pub const NONCE_SPACE: u64 = 1 << 32;

/// sha256d of the empty message.
const SELF_TEST_DIGEST: [u8; 32] = [
    0x5d, 0xf6, 0xe0, 0xe2, 0x76, 0x13, 0x59, 0xd3, 0x0a, 0x82, 0x75, 0x05, 0x8e, 0x29, 0x9f, 0xcc,
    0x03, 0x81, 0x53, 0x45, 0x45, 0xf5, 0x5c, 0xf4, 0x3e, 0x41, 0x98, 0x3f, 0x5d, 0x4c, 0x94, 0x56,
];

/// How often the scan checks whether its session was dropped.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

pub struct SoftwareGateway {
    topology: Topology,
    nonce_limit: u64,
    max_results: usize,
}

impl SoftwareGateway {
    /// `nonce_limit` is clamped to the nonce space.
    pub fn new(topology: Topology, nonce_limit: u64, max_results: usize) -> Self {
        Self {
            topology,
            nonce_limit: nonce_limit.min(NONCE_SPACE),
            max_results,
        }
    }

    /// Nonce slice scanned by each unit, in unit order. Empty slices are
    /// skipped.
    fn partition(&self) -> Vec<(u64, Range<u64>)> {
        let units = self.topology.units().max(1);
        let slice = self.nonce_limit.div_ceil(units).max(1);

        (0..units)
            .map(|unit| {
                let start = (unit * slice).min(self.nonce_limit);
                let end = (start + slice).min(self.nonce_limit);
                (unit, start..end)
            })
            .take_while(|(_, range)| !range.is_empty())
            .collect()
    }

    fn search(&self, header: &HeaderBuffer, target_bits: u32, tx: &mpsc::Sender<GatewayEvent>) {
        let target = target_from_bits(target_bits);
        let chips = u64::from(self.topology.chips_per_chain.max(1));
        let mut found = 0usize;

        for (unit, range) in self.partition() {
            for nonce in range {
                if nonce % CANCEL_CHECK_INTERVAL == 0 && tx.is_closed() {
                    debug!(nonce, "Search cancelled");
                    return;
                }

                // nonce < NONCE_SPACE, so the cast is lossless
                let nonce = nonce as u32;
                let hash = sha256d(&header.with_nonce(nonce));
                if !meets_target(&hash, &target) {
                    continue;
                }

                let event = GatewayEvent::Found(Match {
                    nonce,
                    hash: words_from_le_bytes(&hash),
                });
                if tx.blocking_send(event).is_err() {
                    return;
                }

                found += 1;
                if found >= self.max_results {
                    debug!(found, "Result cap reached");
                    if tx.blocking_send(GatewayEvent::Exhausted).is_err() {
                        debug!("Session gone before end marker");
                    }
                    return;
                }
            }

            trace!(chain = unit / chips, chip = unit % chips, found, "Unit done");
        }

        debug!(found, "Search exhausted");
        if tx.blocking_send(GatewayEvent::Exhausted).is_err() {
            debug!("Session gone before end marker");
        }
    }
}

impl Gateway for SoftwareGateway {
    fn name(&self) -> &'static str {
        "software"
    }

    fn reset(&self) -> Result<(), HardwareError> {
        // Power-on self test against a known double SHA-256 vector
        if sha256d(b"") != SELF_TEST_DIGEST {
            return Err(HardwareError::ResetFailed(
                "hash self test produced a wrong digest".to_string(),
            ));
        }

        info!(
            chains = self.topology.chains,
            chips_per_chain = self.topology.chips_per_chain,
            nonce_limit = self.nonce_limit,
            "Software search units ready"
        );
        Ok(())
    }

    fn dispatch(
        &self,
        header: HeaderBuffer,
        target_bits: u32,
    ) -> Result<mpsc::Receiver<GatewayEvent>, HardwareError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HardwareError::DispatchFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let unit = SoftwareGateway {
            topology: self.topology,
            nonce_limit: self.nonce_limit,
            max_results: self.max_results,
        };

        runtime.spawn_blocking(move || unit.search(&header, target_bits, &tx));
        Ok(rx)
    }
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Expand compact difficulty bits into a big-endian 256-bit target.
///
/// A set sign bit gives a zero target. An exponent past 32 bytes saturates
/// to the maximum target.
pub fn target_from_bits(bits: u32) -> [u8; 32] {
    let mut target = [0u8; 32];
    if bits & 0x0080_0000 != 0 {
        return target;
    }

    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;

    if exponent <= 3 {
        let value = mantissa >> (8 * (3 - exponent));
        target[29..].copy_from_slice(&value.to_be_bytes()[1..]);
    } else if exponent <= 32 {
        let start = 32 - exponent;
        let mantissa = &mantissa.to_be_bytes()[1..];
        for (i, byte) in mantissa.iter().enumerate() {
            if let Some(slot) = target.get_mut(start + i) {
                *slot = *byte;
            }
        }
    } else {
        target = [0xff; 32];
    }

    target
}

/// Whether a digest, read as a little-endian integer, is at or below the
/// big-endian `target`.
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for (h, t) in hash.iter().rev().zip(target.iter()) {
        if h != t {
            return h < t;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_header, words_to_le_bytes};
    use tokio_test::assert_ok;

    fn gateway(nonce_limit: u64, max_results: usize) -> SoftwareGateway {
        SoftwareGateway::new(
            Topology {
                chains: 2,
                chips_per_chain: 3,
            },
            nonce_limit,
            max_results,
        )
    }

    async fn collect(mut rx: mpsc::Receiver<GatewayEvent>) -> (Vec<Match>, Option<GatewayEvent>) {
        let mut found = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                GatewayEvent::Found(m) => found.push(m),
                other => return (found, Some(other)),
            }
        }
        (found, None)
    }

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("") from the Bitcoin test vectors
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_reset_self_test_passes() {
        assert_ok!(gateway(1, 1).reset());
    }

    #[test]
    fn test_target_from_bits() {
        let diff1 = target_from_bits(0x1d00_ffff);
        assert_eq!(&diff1[..6], &[0, 0, 0, 0, 0xff, 0xff]);
        assert!(diff1[6..].iter().all(|b| *b == 0));

        let regtest = target_from_bits(0x207f_ffff);
        assert_eq!(&regtest[..3], &[0x7f, 0xff, 0xff]);

        let small = target_from_bits(0x0212_3456);
        assert_eq!(&small[29..], &[0x00, 0x12, 0x34]);

        assert_eq!(target_from_bits(0x1d80_0000), [0; 32]);
        assert_eq!(target_from_bits(0x2200_ffff), [0xff; 32]);
    }

    #[test]
    fn test_meets_target_compares_little_endian_hash() {
        let target = target_from_bits(0x1d00_ffff);

        let mut low = [0u8; 32];
        low[0] = 0xff; // least significant byte
        assert!(meets_target(&low, &target));

        let mut high = [0u8; 32];
        high[31] = 0x01; // most significant byte
        assert!(!meets_target(&high, &target));

        assert!(meets_target(&[0; 32], &[0; 32]));
    }

    #[test]
    fn test_partition_covers_range_in_order() {
        let parts = gateway(20, 1).partition();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], (0, 0..4));
        assert_eq!(parts[4], (4, 16..20));

        let covered: u64 = parts.iter().map(|(_, r)| r.end - r.start).sum();
        assert_eq!(covered, 20);
    }

    #[test]
    fn test_nonce_limit_is_clamped() {
        let gw = gateway(u64::MAX, 1);
        let parts = gw.partition();
        assert_eq!(parts.last().map(|(_, r)| r.end), Some(NONCE_SPACE));
    }

    #[tokio::test]
    async fn test_easy_target_finds_verified_matches() {
        let gw = gateway(64, 1000);
        let bits = 0x207f_ffff;
        let header = build_header(&[0x0101_0101; 8], bits);
        let (found, end) = collect(gw.dispatch(header.clone(), bits).unwrap()).await;

        assert_eq!(end, Some(GatewayEvent::Exhausted));
        assert!(!found.is_empty());

        let target = target_from_bits(bits);
        let mut last = None;
        for m in &found {
            let hash = words_to_le_bytes(&m.hash);
            assert_eq!(hash, sha256d(&header.with_nonce(m.nonce)));
            assert!(meets_target(&hash, &target));
            assert!(last.map_or(true, |prev| prev < m.nonce));
            last = Some(m.nonce);
        }
    }

    #[tokio::test]
    async fn test_result_cap() {
        let gw = gateway(1000, 3);
        let bits = 0x2100_ffff; // every hash qualifies
        let header = build_header(&[7; 8], bits);
        let (found, end) = collect(gw.dispatch(header, bits).unwrap()).await;

        assert_eq!(end, Some(GatewayEvent::Exhausted));
        assert_eq!(
            found.iter().map(|m| m.nonce).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_search_ends_with_marker() {
        let gw = gateway(1000, 2);
        let bits = 0x2100_ffff;
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        gw.search(&build_header(&[7; 8], bits), bits, &tx);

        assert!(matches!(rx.try_recv(), Ok(GatewayEvent::Found(_))));
        assert!(matches!(rx.try_recv(), Ok(GatewayEvent::Found(_))));
        assert_eq!(rx.try_recv().ok(), Some(GatewayEvent::Exhausted));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_search_returns_once_session_dropped() {
        let gw = gateway(NONCE_SPACE, usize::MAX);
        let bits = 0x2100_ffff;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        drop(rx);

        // Would scan the whole nonce space if the closed channel went unnoticed
        gw.search(&build_header(&[7; 8], bits), bits, &tx);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_impossible_target_yields_nothing() {
        let gw = gateway(128, 10);
        let header = build_header(&[3; 8], 0x0300_0001);
        let (found, end) = collect(gw.dispatch(header, 0x0300_0001).unwrap()).await;

        assert!(found.is_empty());
        assert_eq!(end, Some(GatewayEvent::Exhausted));
    }
}
