//! Turns raw socket frames into payload values.

use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::{Decompress, FlushDecompress, Status};
use serde_json::Value;

use super::codec::Codec;
use crate::error::{ClientError, CodecError};

/// Every complete message of a `zlib-stream` connection ends with a sync flush.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK: usize = 16 * 1024;

/// Buffers and inflates frames for one connection.
///
/// With transport compression the whole connection is one zlib stream, so the inflater lives as
/// long as the connection does and only the byte buffer is cleared between messages.
pub struct FrameDecoder {
    codec: Arc<dyn Codec>,
    compressed: bool,
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl FrameDecoder {
    pub fn new(codec: Arc<dyn Codec>, compressed: bool) -> Self {
        Self {
            codec,
            compressed,
            buffer: Vec::new(),
            inflater: Decompress::new(true),
        }
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops buffered bytes and starts a fresh zlib stream, for a new connection.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.inflater = Decompress::new(true);
    }

    /// Feeds one frame. Returns `Ok(None)` while a compressed message is still incomplete.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Value>, ClientError> {
        let data = if self.compressed {
            self.buffer.extend_from_slice(chunk);
            if !self.buffer.ends_with(&ZLIB_SUFFIX) {
                return Ok(None);
            }

            let inflated = self.inflate();
            self.buffer.clear();
            inflated?
        } else if chunk
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b != b'{' && !self.codec.recognizes(b))
        {
            // The server may deflate single payloads even without `compress=zlib-stream`.
            let mut out = Vec::with_capacity(chunk.len() * 4);
            ZlibDecoder::new(chunk)
                .read_to_end(&mut out)
                .map_err(|e| decode_error(chunk, e.into()))?;
            out
        } else {
            chunk.to_vec()
        };

        self.codec
            .decode(&data)
            .map(Some)
            .map_err(|source| ClientError::Decode { raw: data, source })
    }

    fn inflate(&mut self) -> Result<Vec<u8>, ClientError> {
        let mut out = Vec::with_capacity(self.buffer.len() * 4);
        let start = self.inflater.total_in();

        loop {
            let consumed = (self.inflater.total_in() - start) as usize;
            if out.capacity() - out.len() < INFLATE_CHUNK {
                out.reserve(INFLATE_CHUNK);
            }

            let status = self
                .inflater
                .decompress_vec(&self.buffer[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| decode_error(&self.buffer, e.into()))?;

            let consumed = (self.inflater.total_in() - start) as usize;
            let done = consumed >= self.buffer.len() && out.len() < out.capacity();
            if done || status == Status::StreamEnd {
                break;
            }
            if status == Status::BufError && consumed >= self.buffer.len() {
                break;
            }
        }

        Ok(out)
    }
}

fn decode_error(raw: &[u8], source: CodecError) -> ClientError {
    ClientError::Decode {
        raw: raw.to_vec(),
        source,
    }
}
