use std::collections::BTreeMap;

use base64::Engine;
use tracing::{debug, warn};

use crate::error::{Result, VoiceError};

/// Reassembles `audio_chunk` payloads into one byte sequence.
///
/// Chunks are keyed by index and concatenated in index order on completion,
/// whatever order they arrived in. A second chunk 0, or a chunk declaring a
/// different total, starts a new sequence.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: BTreeMap<u32, Vec<u8>>,
    total: Option<u32>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = None;
    }

    /// Store one base64 chunk at `index`
    pub fn push(&mut self, index: u32, total: u32, payload: &str) -> Result<()> {
        if total == 0 || index >= total {
            return Err(VoiceError::Protocol(format!(
                "chunk index {index} outside 0..{total}"
            )));
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| VoiceError::Protocol(format!("chunk {index} is not valid base64: {e}")))?;

        if index == 0 && self.chunks.contains_key(&0) {
            debug!("Chunk 0 received again, starting a new sequence");
            self.clear();
        }

        match self.total {
            Some(expected) if expected != total => {
                warn!(
                    "Chunk {} declares {} chunks, sequence expects {}; restarting",
                    index, total, expected
                );
                self.clear();
                self.total = Some(total);
            }
            Some(_) => {}
            None => self.total = Some(total),
        }

        if self.chunks.insert(index, bytes).is_some() {
            debug!("Chunk {} received twice, keeping the latest", index);
        }

        Ok(())
    }

    /// Concatenate the buffered sequence and reset the buffer.
    ///
    /// An empty buffer completes to an empty payload. A missing index fails
    /// with `Protocol` and the partial sequence is discarded.
    pub fn complete(&mut self) -> Result<Vec<u8>> {
        let chunks = std::mem::take(&mut self.chunks);
        let total = self.total.take();

        let Some(total) = total else {
            return Ok(Vec::new());
        };

        if let Some(missing) = (0..total).find(|i| !chunks.contains_key(i)) {
            return Err(VoiceError::Protocol(format!(
                "audio chunk {missing} of {total} missing at completion"
            )));
        }

        let mut out = Vec::with_capacity(chunks.values().map(Vec::len).sum());
        for bytes in chunks.into_values() {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}
