//! Work request parser.

use bytes::Buf;
use serde::Deserialize;
use thiserror::Error;

use super::Words256;

/// Size of a work request on the wire.
pub const REQUEST_LEN: usize = 40;

/// A decoded work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    /// 256-bit seed injected into the search header.
    pub seed: Words256,
    /// Compact difficulty threshold.
    pub target_bits: u32,
    /// Client-chosen correlation token, echoed in every result.
    pub id: u32,
}

/// What to do with bytes that arrive after the 40-byte request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingPolicy {
    /// Fail the exchange with `TrailingData`.
    #[default]
    Reject,
    /// Decode the first 40 bytes and drop the rest.
    Ignore,
}

impl std::str::FromStr for TrailingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(TrailingPolicy::Reject),
            "ignore" => Ok(TrailingPolicy::Ignore),
            other => Err(format!("unknown trailing data policy '{other}'")),
        }
    }
}

/// Request decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated request: got {len} bytes, need 40")]
    TruncatedInput { len: usize },
    #[error("trailing data: got {len} bytes, expected exactly 40")]
    TrailingData { len: usize },
}

/// Decode a work request from exactly one request frame.
///
/// Input shorter than a frame is always rejected. Input longer than a frame
/// is rejected or truncated according to `policy`.
pub fn decode(input: &[u8], policy: TrailingPolicy) -> Result<WorkRequest, DecodeError> {
    let len = input.len();
    if len < REQUEST_LEN {
        return Err(DecodeError::TruncatedInput { len });
    }
    if len > REQUEST_LEN && policy == TrailingPolicy::Reject {
        return Err(DecodeError::TrailingData { len });
    }

    let mut buf = &input[..REQUEST_LEN];
    let mut seed = [0u32; 8];
    for word in seed.iter_mut() {
        *word = buf.get_u32_le();
    }
    let target_bits = buf.get_u32_le();
    let id = buf.get_u32_le();

    Ok(WorkRequest {
        seed,
        target_bits,
        id,
    })
}

impl WorkRequest {
    /// Client-side encoding of a request.
    #[cfg(test)]
    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        use bytes::BufMut;

        let mut out = [0u8; REQUEST_LEN];
        let mut buf = &mut out[..];
        for word in &self.seed {
            buf.put_u32_le(*word);
        }
        buf.put_u32_le(self.target_bits);
        buf.put_u32_le(self.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seed_byte: u8, target_bits: u32, id: u32) -> Vec<u8> {
        let mut bytes = vec![seed_byte; 32];
        bytes.extend_from_slice(&target_bits.to_le_bytes());
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes
    }

    #[test]
    fn test_decode_request() {
        let bytes = frame(0x01, 0x1d00_ffff, 7);
        let request = decode(&bytes, TrailingPolicy::Reject).unwrap();

        assert_eq!(request.seed, [0x0101_0101; 8]);
        assert_eq!(request.target_bits, 0x1d00_ffff);
        assert_eq!(request.id, 7);
    }

    #[test]
    fn test_decode_preserves_word_order() {
        let mut bytes: Vec<u8> = (0..32).collect();
        bytes.extend_from_slice(&[0; 8]);

        let request = decode(&bytes, TrailingPolicy::Reject).unwrap();
        assert_eq!(request.seed[0], 0x0302_0100);
        assert_eq!(request.seed[7], 0x1f1e_1d1c);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = frame(0xab, 1, 2);
        assert_eq!(
            decode(&bytes[..39], TrailingPolicy::Reject),
            Err(DecodeError::TruncatedInput { len: 39 })
        );
        assert_eq!(
            decode(&[], TrailingPolicy::Ignore),
            Err(DecodeError::TruncatedInput { len: 0 })
        );
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut bytes = frame(0xab, 1, 2);
        bytes.push(0xff);
        assert_eq!(
            decode(&bytes, TrailingPolicy::Reject),
            Err(DecodeError::TrailingData { len: 41 })
        );
    }

    #[test]
    fn test_trailing_data_ignored() {
        let mut bytes = frame(0xab, 1, 2);
        bytes.extend_from_slice(b"extra");

        let request = decode(&bytes, TrailingPolicy::Ignore).unwrap();
        assert_eq!(request.target_bits, 1);
        assert_eq!(request.id, 2);
    }

    #[test]
    fn test_encoded_request_decodes_back() {
        let request = WorkRequest {
            seed: [1, 2, 3, 4, 0xdead_beef, 6, 7, u32::MAX],
            target_bits: 0x207f_ffff,
            id: 0x1234_5678,
        };

        let decoded = decode(&request.to_bytes(), TrailingPolicy::Reject).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("reject".parse::<TrailingPolicy>(), Ok(TrailingPolicy::Reject));
        assert_eq!("IGNORE".parse::<TrailingPolicy>(), Ok(TrailingPolicy::Ignore));
        assert!("drop".parse::<TrailingPolicy>().is_err());
    }
}
