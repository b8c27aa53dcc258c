//! Result frame encoding.

use bytes::{BufMut, BytesMut};

use super::Words256;

/// Size of one result frame on the wire.
pub const RESPONSE_LEN: usize = 40;

/// One match reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultRecord {
    /// Id of the request this result belongs to.
    pub id: u32,
    pub nonce: u32,
    pub hash: Words256,
}

impl ResultRecord {
    /// Encode as a single 40-byte frame.
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        let mut buf = &mut out[..];
        self.put(&mut buf);
        out
    }

    /// Append one frame to an outgoing buffer.
    pub fn encode_into(&self, output: &mut BytesMut) {
        output.reserve(RESPONSE_LEN);
        self.put(output);
    }

    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.nonce);
        for word in &self.hash {
            buf.put_u32_le(*word);
        }
    }

    /// Client-side parsing of a response stream into records.
    ///
    /// Returns `None` if the stream is not a whole number of frames.
    #[cfg(test)]
    pub fn decode_frames(mut input: &[u8]) -> Option<Vec<ResultRecord>> {
        use bytes::Buf;

        if input.len() % RESPONSE_LEN != 0 {
            return None;
        }
        let mut records = Vec::with_capacity(input.len() / RESPONSE_LEN);
        while input.has_remaining() {
            let id = input.get_u32_le();
            let nonce = input.get_u32_le();
            let mut hash = [0u32; 8];
            for word in hash.iter_mut() {
                *word = input.get_u32_le();
            }
            records.push(ResultRecord { id, nonce, hash });
        }
        Some(records)
    }
}
