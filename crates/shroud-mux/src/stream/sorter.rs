//! Reordering of inbound frames
//!
//! Frames of one stream may travel over different physical connections and
//! overtake each other. The sorter holds early arrivals back until every
//! frame before them has been seen.

use std::collections::BTreeMap;

use shroud_protocol::Frame;

/// How far ahead of the next expected frame a frame may arrive; anything
/// beyond is dropped so a peer cannot grow the buffer without bound
pub(crate) const REORDER_WINDOW: u32 = 4096;

#[derive(Debug, Default)]
pub(crate) struct FrameSorter {
    next_seq: u32,
    pending: BTreeMap<u32, Frame>,
}

impl FrameSorter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept a frame and return every frame that is now deliverable, in
    /// sequence order
    pub(crate) fn push(&mut self, frame: Frame) -> Vec<Frame> {
        if frame.seq < self.next_seq {
            tracing::trace!(seq = frame.seq, "dropping duplicate frame");
            return Vec::new();
        }
        if frame.seq - self.next_seq >= REORDER_WINDOW {
            tracing::warn!(
                stream = %frame.stream_id,
                seq = frame.seq,
                expected = self.next_seq,
                buffered = self.buffered(),
                "dropping frame beyond reorder window"
            );
            return Vec::new();
        }
        self.pending.insert(frame.seq, frame);

        let mut ready = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_seq) {
            self.next_seq = self.next_seq.wrapping_add(1);
            ready.push(frame);
        }
        ready
    }

    /// Frames held back waiting for a gap to fill
    pub(crate) fn buffered(&self) -> usize {
        self.pending.len()
    }
}
