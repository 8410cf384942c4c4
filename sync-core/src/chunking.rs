//! Chunked framing and reassembly of data-channel payloads.
//!
//! A payload is serialized to JSON once. If the bytes fit under the chunk
//! size it travels as a single frame; otherwise the bytes are sliced into
//! fixed-size pieces, each base64-encoded into a [`Chunk`] frame that names
//! its transfer, index and total. Slices are sized so that the encoded
//! chunk frame, envelope included, stays within the chunk size.
//!
//! The receiving side keeps one [`Reassembler`] per session. Chunks land in
//! index-addressed slots, so arrival order does not matter. Once every slot
//! is filled the bytes are concatenated, parsed, and the transfer is
//! forgotten.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use std::collections::HashMap;
use sync_types::{Chunk, Complete, Frame, PayloadKind, PushData, TransferId};
use thiserror::Error;

/// Default chunk size and single-frame threshold in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes of a chunk frame reserved for everything but the slice data.
pub const CHUNK_ENVELOPE: usize = 192;

/// Default upper bound on chunks in one transfer.
pub const DEFAULT_MAX_CHUNKS: u32 = 4096;

/// Errors from framing or reassembly.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The outbound payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The outbound payload needs more chunks than allowed.
    #[error("payload needs {needed} chunks, limit is {max}")]
    TooLarge {
        /// Chunks the payload would need
        needed: usize,
        /// Configured limit
        max: u32,
    },

    /// A chunk announced an unusable total.
    #[error("invalid total_chunks {total} (limit {max})")]
    InvalidTotal {
        /// Announced total
        total: u32,
        /// Configured limit
        max: u32,
    },

    /// A chunk's index is outside its transfer.
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Offending index
        index: u32,
        /// Transfer size
        total: u32,
    },

    /// A chunk disagrees with its transfer about the total.
    #[error("transfer {transfer_id} has {expected} chunks, frame says {got}")]
    TotalMismatch {
        /// Transfer in question
        transfer_id: TransferId,
        /// Total from the first chunk
        expected: u32,
        /// Total in this chunk
        got: u32,
    },

    /// A chunk's data is not valid base64.
    #[error("chunk data is not valid base64: {0}")]
    Encoding(String),

    /// The reassembled bytes are not a valid payload.
    #[error("reassembled payload of transfer {transfer_id} is corrupt: {source}")]
    Corrupt {
        /// Transfer that was discarded
        transfer_id: TransferId,
        /// What the payload was meant to be
        kind: PayloadKind,
        /// Parse failure
        #[source]
        source: serde_json::Error,
    },
}

impl ChunkError {
    /// True for errors that discarded a whole transfer, as opposed to a
    /// single dropped frame.
    pub fn is_data_error(&self) -> bool {
        matches!(self, ChunkError::Corrupt { .. })
    }

    /// Kind of the transfer a data error discarded.
    pub fn discarded_kind(&self) -> Option<PayloadKind> {
        match self {
            ChunkError::Corrupt { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Splits outbound payloads into frames.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    max_chunks: u32,
}

impl Chunker {
    /// Create a chunker with the given chunk size and per-transfer limit.
    pub fn new(chunk_size: usize, max_chunks: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_chunks,
        }
    }

    /// The single-frame threshold in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Raw bytes carried by each chunk frame.
    pub fn slice_size(&self) -> usize {
        (self.chunk_size.saturating_sub(CHUNK_ENVELOPE) / 4 * 3).max(1)
    }

    /// Produce the frames that carry `payload`.
    ///
    /// Small payloads become one [`Frame::Complete`] (or [`Frame::PushData`]
    /// for pushes). Large ones become an ordered run of [`Frame::Chunk`]s
    /// under a fresh transfer id.
    pub fn frames(&self, payload: &Value, kind: PayloadKind) -> Result<Vec<Frame>, ChunkError> {
        let bytes = serde_json::to_vec(payload).map_err(ChunkError::Serialize)?;

        if bytes.len() <= self.chunk_size {
            let frame = if kind.push {
                Frame::PushData(PushData {
                    data_type: kind.data_type,
                    data: payload.clone(),
                })
            } else {
                Frame::Complete(Complete {
                    data: payload.clone(),
                    data_type: kind.data_type,
                })
            };
            return Ok(vec![frame]);
        }

        let slice_size = self.slice_size();
        let needed = bytes.len().div_ceil(slice_size);
        if needed > self.max_chunks as usize {
            return Err(ChunkError::TooLarge {
                needed,
                max: self.max_chunks,
            });
        }

        let transfer_id = TransferId::new();
        let total_chunks = needed as u32;
        let frames = bytes
            .chunks(slice_size)
            .enumerate()
            .map(|(index, slice)| {
                Frame::Chunk(Chunk {
                    transfer_id,
                    chunk_index: index as u32,
                    total_chunks,
                    data: STANDARD.encode(slice),
                    data_type: kind.data_type,
                    push: kind.push,
                })
            })
            .collect();
        Ok(frames)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNKS)
    }
}

/// A payload whose every chunk has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPayload {
    /// Transfer that produced it
    pub transfer_id: TransferId,
    /// What the payload represents
    pub kind: PayloadKind,
    /// The parsed payload
    pub payload: Value,
}

#[derive(Debug)]
struct Transfer {
    kind: PayloadKind,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
}

/// Per-session reassembly table.
///
/// The table belongs to one session, so the source peer of every transfer
/// is implicit. Incomplete transfers live until [`Reassembler::clear`] is
/// called at session teardown.
#[derive(Debug)]
pub struct Reassembler {
    max_chunks: u32,
    transfers: HashMap<TransferId, Transfer>,
}

impl Reassembler {
    /// Create an empty table accepting transfers of up to `max_chunks`.
    pub fn new(max_chunks: u32) -> Self {
        Self {
            max_chunks,
            transfers: HashMap::new(),
        }
    }

    /// Place one chunk.
    ///
    /// Returns the completed payload when this chunk filled the last slot.
    /// Protocol errors leave the table untouched; a corrupt payload discards
    /// its transfer.
    pub fn accept(&mut self, chunk: Chunk) -> Result<Option<CompletedPayload>, ChunkError> {
        let Chunk {
            transfer_id,
            chunk_index,
            total_chunks,
            data,
            ..
        } = &chunk;

        if *total_chunks == 0 || *total_chunks > self.max_chunks {
            return Err(ChunkError::InvalidTotal {
                total: *total_chunks,
                max: self.max_chunks,
            });
        }
        if chunk_index >= total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: *chunk_index,
                total: *total_chunks,
            });
        }
        if let Some(existing) = self.transfers.get(transfer_id) {
            let expected = existing.slots.len() as u32;
            if expected != *total_chunks {
                return Err(ChunkError::TotalMismatch {
                    transfer_id: *transfer_id,
                    expected,
                    got: *total_chunks,
                });
            }
        }

        let bytes = STANDARD
            .decode(data)
            .map_err(|e| ChunkError::Encoding(e.to_string()))?;

        let transfer = self
            .transfers
            .entry(*transfer_id)
            .or_insert_with(|| Transfer {
                kind: chunk.kind(),
                slots: vec![None; *total_chunks as usize],
                filled: 0,
            });

        let slot = &mut transfer.slots[*chunk_index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(bytes);
        transfer.filled += 1;

        if transfer.filled < *total_chunks {
            return Ok(None);
        }

        let transfer_id = *transfer_id;
        let Some(done) = self.transfers.remove(&transfer_id) else {
            return Ok(None);
        };
        let joined: Vec<u8> = done.slots.into_iter().flatten().flatten().collect();
        let payload = serde_json::from_slice(&joined)
            .map_err(|source| ChunkError::Corrupt {
                transfer_id,
                kind: done.kind,
                source,
            })?;

        Ok(Some(CompletedPayload {
            transfer_id,
            kind: done.kind,
            payload,
        }))
    }

    /// Number of transfers still waiting for chunks.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Drop every partial transfer.
    pub fn clear(&mut self) {
        self.transfers.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNKS)
    }
}
