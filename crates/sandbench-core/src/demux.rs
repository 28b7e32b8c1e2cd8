//! Decoder for multiplexed stdout/stderr exec streams.
//!
//! Wire format, one frame after another:
//!
//! ```text
//! ┌──────────┬───────────┬──────────────────┬─────────────────┐
//! │ type (1) │ 0 0 0 (3) │ size (4, BE u32) │ payload (size)  │
//! └──────────┴───────────┴──────────────────┴─────────────────┘
//! ```
//!
//! Type 1 is stdout and type 2 is stderr. Frames may be split across
//! transport chunks arbitrarily, so the decoder buffers until a frame is
//! complete.

use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 8;

/// Which output stream a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn type_byte(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// One decoded fragment of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Stateful decoder for one exec stream.
#[derive(Debug, Default)]
pub struct StreamDemultiplexer {
    pending: BytesMut,
    /// Stream offset of the first byte in `pending`
    offset: u64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl StreamDemultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk and return the fragments it completed.
    ///
    /// Decoded bytes are also accumulated for [`finish`](Self::finish).
    ///
    /// # Errors
    /// Returns [`DecodeError::UnknownStreamType`] on a frame whose type is
    /// neither stdout nor stderr. The decoder must not be reused after that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<OutputChunk>, DecodeError> {
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        while self.pending.len() >= HEADER_LEN {
            let stream = match self.pending[0] {
                1 => StreamKind::Stdout,
                2 => StreamKind::Stderr,
                other => {
                    return Err(DecodeError::UnknownStreamType {
                        stream_type: other,
                        offset: self.offset,
                    })
                }
            };
            let size = u32::from_be_bytes([
                self.pending[4],
                self.pending[5],
                self.pending[6],
                self.pending[7],
            ]) as usize;

            if self.pending.len() < HEADER_LEN + size {
                break;
            }

            self.pending.advance(HEADER_LEN);
            let data = self.pending.split_to(size).freeze();
            self.offset += (HEADER_LEN + size) as u64;

            if data.is_empty() {
                continue;
            }
            match stream {
                StreamKind::Stdout => self.stdout.extend_from_slice(&data),
                StreamKind::Stderr => self.stderr.extend_from_slice(&data),
            }
            out.push(OutputChunk { stream, data });
        }

        Ok(out)
    }

    /// End of stream. Returns everything decoded as `(stdout, stderr)`.
    ///
    /// # Errors
    /// Returns [`DecodeError::Truncated`] if a partial frame is still buffered.
    pub fn finish(self) -> Result<(Vec<u8>, Vec<u8>), DecodeError> {
        if !self.pending.is_empty() {
            return Err(DecodeError::Truncated {
                remaining: self.pending.len(),
            });
        }
        Ok((self.stdout, self.stderr))
    }
}

/// Decode a complete multiplexed buffer into `(stdout, stderr)`.
pub fn demux(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>), DecodeError> {
    let mut decoder = StreamDemultiplexer::new();
    decoder.push(data)?;
    decoder.finish()
}

/// Encode `payload` as frames of the given stream.
///
/// Payloads larger than a frame can carry are split over several frames.
/// An empty payload is a single header with size zero.
pub fn encode_frame(stream: StreamKind, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    let mut put = |part: &[u8]| {
        out.extend_from_slice(&[stream.type_byte(), 0, 0, 0]);
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    };
    if payload.is_empty() {
        put(payload);
    }
    for part in payload.chunks(u32::MAX as usize) {
        put(part);
    }
    out.freeze()
}
