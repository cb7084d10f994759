use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode bytes to Base64 string
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode Base64 string to bytes
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Accumulates streamed body bytes into frame-sized chunks
///
/// Bytes are pushed as they arrive from a socket; every time `chunk_size`
/// bytes are available a full chunk is handed back, and `finish` drains the
/// remainder.
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Append bytes, returning every chunk that is now complete
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut full = Vec::new();
        while self.buf.len() >= self.chunk_size {
            let rest = self.buf.split_off(self.chunk_size);
            full.push(std::mem::replace(&mut self.buf, rest));
        }
        full
    }

    /// Take whatever is buffered (possibly empty)
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
