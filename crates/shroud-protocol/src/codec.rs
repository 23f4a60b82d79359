//! Tokio codec for multiplexing frames
//!
//! This is the clear-text layout that every obfuscator wraps. It is also
//! usable directly over a `Framed` transport when no disguise is needed.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameHeader, MAX_PAYLOAD_SIZE};

/// Frame codec that remembers a decoded header while the payload is
/// still arriving
#[derive(Debug, Default)]
pub struct FrameCodec {
    awaiting_payload: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_payload(len: usize) -> Result<usize, ProtocolError> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let header = match self.awaiting_payload.take() {
            Some(header) => header,
            None => match FrameHeader::decode(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        let len = check_payload(header.payload_length as usize)?;
        if src.len() < len {
            src.reserve(len - src.len());
            self.awaiting_payload = Some(header);
            return Ok(None);
        }

        Ok(Some(Frame {
            stream_id: header.stream_id,
            seq: header.seq,
            closing: header.closing,
            payload: src.split_to(len).freeze(),
        }))
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        check_payload(frame.payload.len())?;
        frame.header().encode(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
