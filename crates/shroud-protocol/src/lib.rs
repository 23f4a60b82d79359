//! shroud-protocol: Wire layer for shroud stream multiplexing
//!
//! This crate defines how multiplexed frames are laid out, how they are
//! disguised as TLS application-data records on the wire, and how exactly
//! one record is read back off a physical connection.

pub mod codec;
pub mod error;
pub mod frame;
pub mod id;
pub mod obfs;
pub mod record;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use id::{SessionId, StreamId};
pub use obfs::{Deobfser, MaskedObfs, Obfser, PlainObfs};
pub use record::{RecordHeader, RecordReader, TlsRecordReader, MAX_RECORD_BODY, RECORD_HEADER_SIZE};
