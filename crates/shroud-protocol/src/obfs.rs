//! Obfuscation codec pair
//!
//! An [`Obfser`] turns a [`Frame`] into one complete wire record and a
//! [`Deobfser`] does the reverse. A session holds one pair and hands it to
//! every stream (outbound) and to the switchboard (inbound).
//!
//! Two codecs ship with the crate:
//!
//! - [`PlainObfs`]: record header around the clear frame. Useful in tests
//!   and when the transport below is already encrypted.
//! - [`MaskedObfs`]: the frame is masked with a keystream derived from the
//!   session key and a random per-record nonce, so headers and payloads
//!   are indistinguishable from random TLS application data.

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::FrameCodec;
use crate::error::ProtocolError;
use crate::frame::{Frame, HEADER_SIZE};
use crate::record::{RecordHeader, RECORD_HEADER_SIZE};

/// Serializes a frame into its obfuscated wire representation
pub trait Obfser: Send + Sync {
    /// Produce one complete record, header included
    fn obfuscate(&self, frame: &Frame) -> Result<Bytes, ProtocolError>;
}

/// Recovers a frame from one complete wire record
pub trait Deobfser: Send + Sync {
    /// Parse a record previously produced by the matching [`Obfser`]
    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, ProtocolError>;
}

/// Decode a buffer that must contain exactly one frame
fn decode_exact(mut buf: BytesMut) -> Result<Frame, ProtocolError> {
    let actual = buf.len();
    let frame = FrameCodec::new()
        .decode(&mut buf)?
        .ok_or(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE,
            actual,
        })?;
    if !buf.is_empty() {
        return Err(ProtocolError::InvalidHeader);
    }
    Ok(frame)
}

/// Wrap a finished body into a record
fn seal(body: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut record = BytesMut::with_capacity(RECORD_HEADER_SIZE + body.len());
    RecordHeader::new(body.len())?.encode(&mut record);
    record.extend_from_slice(body);
    Ok(record.freeze())
}

/// Record header around the clear-text frame
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainObfs;

impl Obfser for PlainObfs {
    fn obfuscate(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let mut body = BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
        FrameCodec::new().encode(frame, &mut body)?;
        seal(&body)
    }
}

impl Deobfser for PlainObfs {
    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, ProtocolError> {
        let body = RecordHeader::body(record)?;
        decode_exact(BytesMut::from(body))
    }
}

/// Length of the per-record nonce
pub const NONCE_SIZE: usize = 8;

/// Keystream-masked frames keyed by the session key
#[derive(Clone)]
pub struct MaskedObfs {
    key: Bytes,
}

impl std::fmt::Debug for MaskedObfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskedObfs").finish_non_exhaustive()
    }
}

impl MaskedObfs {
    /// Create a codec keyed by `session_key`
    pub fn new(session_key: impl Into<Bytes>) -> Self {
        Self {
            key: session_key.into(),
        }
    }

    /// XOR `data` with SHA-256(key || nonce || block) in counter mode
    fn apply_mask(&self, nonce: &[u8], data: &mut [u8]) {
        for (block, chunk) in data.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(&self.key);
            hasher.update(nonce);
            hasher.update((block as u64).to_be_bytes());
            let pad = hasher.finalize();
            for (b, p) in chunk.iter_mut().zip(pad.iter()) {
                *b ^= p;
            }
        }
    }
}

impl Obfser for MaskedObfs {
    fn obfuscate(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let nonce: [u8; NONCE_SIZE] = rand::random();

        let mut body = BytesMut::with_capacity(NONCE_SIZE + HEADER_SIZE + frame.payload.len());
        body.extend_from_slice(&nonce);
        FrameCodec::new().encode(frame, &mut body)?;
        self.apply_mask(&nonce, &mut body[NONCE_SIZE..]);

        seal(&body)
    }
}

impl Deobfser for MaskedObfs {
    fn deobfuscate(&self, record: &[u8]) -> Result<Frame, ProtocolError> {
        let body = RecordHeader::body(record)?;
        if body.len() < NONCE_SIZE + HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: NONCE_SIZE + HEADER_SIZE,
                actual: body.len(),
            });
        }

        let (nonce, masked) = body.split_at(NONCE_SIZE);
        let mut plain = BytesMut::from(masked);
        self.apply_mask(nonce, &mut plain);

        decode_exact(plain)
    }
}
