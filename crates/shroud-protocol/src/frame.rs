//! Frame header encoding/decoding
//!
//! The frame format uses a 12-byte header:
//! - stream_id: 4 bytes (u32, big-endian)
//! - seq: 4 bytes (u32, big-endian)
//! - flags: 1 byte (bit 0 = closing)
//! - payload_length: 3 bytes (u24, big-endian)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::id::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 12;

/// Maximum payload carried by one frame (one TLS record's plaintext)
pub const MAX_PAYLOAD_SIZE: usize = 16384;

const FLAG_CLOSING: u8 = 0x01;

/// A multiplexed frame belonging to one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Per-stream send sequence number
    pub seq: u32,
    /// Whether this frame closes the stream
    pub closing: bool,
    /// Stream data
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(stream_id: StreamId, seq: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            closing: false,
            payload,
        }
    }

    /// Create a stream closing frame
    pub fn closing(stream_id: StreamId, seq: u32) -> Self {
        Self {
            stream_id,
            seq,
            closing: true,
            payload: Bytes::new(),
        }
    }

    /// Header describing this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.stream_id, self.seq, self.closing, self.payload.len() as u32)
    }
}

/// Frame header containing routing, ordering and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// Per-stream send sequence number
    pub seq: u32,
    /// Closing flag
    pub closing: bool,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(stream_id: StreamId, seq: u32, closing: bool, payload_length: u32) -> Self {
        Self {
            stream_id,
            seq,
            closing,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.stream_id.as_u32());
        dst.put_u32(self.seq);
        dst.put_u8(if self.closing { FLAG_CLOSING } else { 0 });
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if unknown flag bits are set.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming anything
        let flags = src[8];
        if flags & !FLAG_CLOSING != 0 {
            return Err(ProtocolError::InvalidHeader);
        }

        let stream_id = StreamId::new(src.get_u32());
        let seq = src.get_u32();
        let _ = src.get_u8(); // flags already parsed
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;
        let payload_length = (len_high << 16) | len_low;

        Ok(Some(Self {
            stream_id,
            seq,
            closing: flags & FLAG_CLOSING != 0,
            payload_length,
        }))
    }
}
