//! Sampler work/result protocol.
//!
//! One exchange per TCP connection:
//! - Client sends one fixed-size work request
//! - Server answers with zero or more fixed-size result frames, then closes
//!
//! ## Wire Format
//!
//! All integers are little-endian. 256-bit values travel as 8 ordered
//! 32-bit words, which is byte-for-byte the same as the raw 32 bytes.
//!
//! ```text
//! Request  (40 bytes): seed[32] | target_bits[4] | id[4]
//! Response (40 bytes): id[4] | nonce[4] | hash[32]     (repeated per result)
//! ```
//!
//! A malformed request is answered with an abortive close and no bytes.
//! A valid request with no results is answered with a clean close and no
//! bytes.
//!
//! ## Search Header
//!
//! The seed is injected into an 80-byte block-style header that is handed
//! to the search hardware:
//!
//! ```text
//! offset  0: version[4] = 2
//! offset  4: zeros[32]
//! offset 36: seed[32]
//! offset 68: zeros[4]
//! offset 72: target_bits[4]
//! offset 76: nonce[4]  (zero in the built header, varied by the hardware)
//! ```

pub mod header;
pub mod request;
pub mod response;

pub use header::{build_header, HeaderBuffer};
pub use request::{decode, DecodeError, TrailingPolicy, WorkRequest, REQUEST_LEN};
pub use response::{ResultRecord, RESPONSE_LEN};

/// A 256-bit value as 8 ordered 32-bit words.
pub type Words256 = [u32; 8];

/// Read 32 bytes as 8 little-endian words, preserving order.
pub fn words_from_le_bytes(bytes: &[u8; 32]) -> Words256 {
    let mut words = [0u32; 8];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Write 8 words back out as 32 little-endian bytes.
pub fn words_to_le_bytes(words: &Words256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}
