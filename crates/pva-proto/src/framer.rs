//! Segmentation of oversized logical messages.
//!
//! A logical payload larger than the send-buffer budget goes out as a
//! chain of frames marked FIRST/MIDDLE/LAST, each with its own header but
//! sharing the command and byte order. The receive side accumulates
//! payload until the LAST frame and yields the byte-identical original.

use crate::{
    errors::{ProtocolError, Result},
    header::{Header, Role, Segmentation},
    wire::ByteOrder,
};

/// Splits logical messages into wire frames.
#[derive(Debug, Clone)]
pub struct Segmenter {
    /// Largest payload carried by a single frame.
    max_payload: usize,
}

impl Segmenter {
    /// A segmenter with the given per-frame payload budget.
    pub fn new(max_payload: usize) -> Self {
        debug_assert!(max_payload > 0);
        Self { max_payload }
    }

    /// Encode a logical message as one or more complete frames, appended
    /// to `dst`.
    pub fn write_message(
        &self,
        command: u8,
        role: Role,
        order: ByteOrder,
        payload: &[u8],
        dst: &mut Vec<u8>,
    ) {
        if payload.len() <= self.max_payload {
            Header::data(command, role, order, payload.len() as u32).encode(dst);
            dst.extend_from_slice(payload);
            return;
        }

        let chunks: Vec<&[u8]> = payload.chunks(self.max_payload).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut header = Header::data(command, role, order, chunk.len() as u32);
            header.segmentation = match i {
                0 => Segmentation::First,
                i if i == last => Segmentation::Last,
                _ => Segmentation::Middle,
            };
            header.encode(dst);
            dst.extend_from_slice(chunk);
        }
    }
}

#[derive(Debug)]
struct Pending {
    header: Header,
    buf: Vec<u8>,
}

/// Reassembles segmented messages on the receive side.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Option<Pending>,
}

impl Reassembler {
    /// Fresh reassembler with no chain in progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame. Returns a complete logical message
    /// (header + payload) when one is available.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SegmentMismatch`] when the chain discipline is
    /// violated: stray MIDDLE/LAST, nested FIRST, interleaved commands, or
    /// a byte-order change mid-chain.
    pub fn push(&mut self, header: Header, payload: &[u8]) -> Result<Option<(Header, Vec<u8>)>> {
        match header.segmentation {
            Segmentation::Complete => {
                if self.pending.is_some() {
                    return Err(ProtocolError::SegmentMismatch(
                        "complete frame inside a segment chain",
                    ));
                }
                Ok(Some((header, payload.to_vec())))
            }
            Segmentation::First => {
                if self.pending.is_some() {
                    return Err(ProtocolError::SegmentMismatch("nested FIRST segment"));
                }
                self.pending = Some(Pending { header, buf: payload.to_vec() });
                Ok(None)
            }
            Segmentation::Middle | Segmentation::Last => {
                let pending = self.pending.as_mut().ok_or(ProtocolError::SegmentMismatch(
                    "MIDDLE/LAST segment without FIRST",
                ))?;
                if header.command != pending.header.command {
                    return Err(ProtocolError::SegmentMismatch("command changed mid-chain"));
                }
                if header.order != pending.header.order {
                    return Err(ProtocolError::SegmentMismatch("byte order changed mid-chain"));
                }
                pending.buf.extend_from_slice(payload);
                if header.segmentation == Segmentation::Middle {
                    return Ok(None);
                }
                let Pending { mut header, buf } = self
                    .pending
                    .take()
                    .ok_or(ProtocolError::SegmentMismatch("MIDDLE/LAST segment without FIRST"))?;
                header.segmentation = Segmentation::Complete;
                header.payload_size = buf.len() as u32;
                Ok(Some((header, buf)))
            }
        }
    }

    /// Whether a chain is currently being accumulated.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }
}
