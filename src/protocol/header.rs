//! Search header construction.

use super::{words_to_le_bytes, Words256};

/// Size of the search header in bytes.
pub const HEADER_LEN: usize = 80;

/// Version field written at offset 0.
pub const HEADER_VERSION: u32 = 2;

const VERSION_OFFSET: usize = 0;
const SEED_OFFSET: usize = 36;
const TARGET_OFFSET: usize = 72;
const NONCE_OFFSET: usize = 76;

/// An 80-byte search header.
///
/// Only [`build_header`] creates one, so every instance carries the fixed
/// layout: version at 0, seed at 36..68, target bits at 72..76 and zeros
/// everywhere else. There is no way to mutate it after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderBuffer([u8; HEADER_LEN]);

impl HeaderBuffer {
    /// Raw header bytes.
    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    pub fn version(&self) -> u32 {
        self.read_u32(VERSION_OFFSET)
    }

    pub fn seed_bytes(&self) -> &[u8] {
        &self.0[SEED_OFFSET..SEED_OFFSET + 32]
    }

    pub fn target_bits(&self) -> u32 {
        self.read_u32(TARGET_OFFSET)
    }

    /// Copy of the header with `nonce` written into the last four bytes.
    pub fn with_nonce(&self, nonce: u32) -> [u8; HEADER_LEN] {
        let mut bytes = *self.as_bytes();
        bytes[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        bytes
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b = &self.0[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl std::fmt::Debug for HeaderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderBuffer")
            .field("version", &self.version())
            .field("seed", &hex::encode(self.seed_bytes()))
            .field("target_bits", &format_args!("{:#010x}", self.target_bits()))
            .finish()
    }
}

/// Build the search header for a seed and compact target.
///
/// Pure and deterministic: equal inputs always give byte-identical output.
pub fn build_header(seed: &Words256, target_bits: u32) -> HeaderBuffer {
    let mut bytes = [0u8; HEADER_LEN];

    bytes[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    bytes[SEED_OFFSET..SEED_OFFSET + 32].copy_from_slice(&words_to_le_bytes(seed));
    bytes[TARGET_OFFSET..TARGET_OFFSET + 4].copy_from_slice(&target_bits.to_le_bytes());

    HeaderBuffer(bytes)
}
