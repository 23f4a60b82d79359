//! TLS-shaped record layer
//!
//! On the wire every obfuscated frame is wrapped in a record that looks like
//! TLS 1.2 application data:
//!
//! ```text
//! +------+---------+------------+----------------+
//! | 0x17 | 0x03 03 | length u16 | body (length)  |
//! +------+---------+------------+----------------+
//! ```
//!
//! A [`RecordReader`] is what the switchboard uses to pull exactly one
//! record off a physical connection before handing it to a deobfuscator.

use std::io;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

/// Size of the record header in bytes
pub const RECORD_HEADER_SIZE: usize = 5;

/// Largest record body accepted (TLS ciphertext limit)
pub const MAX_RECORD_BODY: usize = 16384 + 2048;

const APPLICATION_DATA: u8 = 0x17;
const TLS12_VERSION: [u8; 2] = [0x03, 0x03];

/// Header of one TLS application-data record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Body length in bytes
    pub length: u16,
}

impl RecordHeader {
    /// Header for a body of `length` bytes
    pub fn new(length: usize) -> Result<Self, ProtocolError> {
        if length > MAX_RECORD_BODY {
            return Err(ProtocolError::PayloadTooLarge {
                size: length,
                max: MAX_RECORD_BODY,
            });
        }
        Ok(Self {
            length: length as u16,
        })
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(RECORD_HEADER_SIZE);
        dst.put_u8(APPLICATION_DATA);
        dst.put_slice(&TLS12_VERSION);
        dst.put_u16(self.length);
    }

    /// Parse a header from the first five bytes of `src`
    pub fn parse(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < RECORD_HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                expected: RECORD_HEADER_SIZE,
                actual: src.len(),
            });
        }
        if src[0] != APPLICATION_DATA {
            return Err(ProtocolError::UnknownRecordType(src[0]));
        }
        let length = u16::from_be_bytes([src[3], src[4]]);
        if length as usize > MAX_RECORD_BODY {
            return Err(ProtocolError::PayloadTooLarge {
                size: length as usize,
                max: MAX_RECORD_BODY,
            });
        }
        Ok(Self { length })
    }

    /// Split a complete record into its body, checking the declared length
    pub fn body(record: &[u8]) -> Result<&[u8], ProtocolError> {
        let header = Self::parse(record)?;
        let expected = RECORD_HEADER_SIZE + header.length as usize;
        if record.len() != expected {
            return Err(ProtocolError::IncompleteFrame {
                expected,
                actual: record.len(),
            });
        }
        Ok(&record[RECORD_HEADER_SIZE..])
    }
}

/// Reads exactly one complete wire-level message from a connection
#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Read one record into `buf` (replacing its contents) and return its
    /// total length including the header
    async fn read_record(
        &self,
        conn: &mut (dyn AsyncRead + Unpin + Send),
        buf: &mut BytesMut,
    ) -> io::Result<usize>;
}

/// [`RecordReader`] for TLS application-data records
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsRecordReader;

#[async_trait]
impl RecordReader for TlsRecordReader {
    async fn read_record(
        &self,
        conn: &mut (dyn AsyncRead + Unpin + Send),
        buf: &mut BytesMut,
    ) -> io::Result<usize> {
        buf.clear();
        buf.resize(RECORD_HEADER_SIZE, 0);
        conn.read_exact(&mut buf[..RECORD_HEADER_SIZE]).await?;

        let header = RecordHeader::parse(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let total = RECORD_HEADER_SIZE + header.length as usize;
        buf.resize(total, 0);
        conn.read_exact(&mut buf[RECORD_HEADER_SIZE..]).await?;

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        RecordHeader::new(body.len()).unwrap().encode(&mut buf);
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn test_reads_one_record_at_a_time() {
        let mut wire = record(b"first").to_vec();
        wire.extend_from_slice(&record(b"second!"));
        let mut conn: &[u8] = &wire;

        let reader = TlsRecordReader;
        let mut buf = BytesMut::new();

        let n = reader.read_record(&mut conn, &mut buf).await.unwrap();
        assert_eq!(n, RECORD_HEADER_SIZE + 5);
        assert_eq!(RecordHeader::body(&buf).unwrap(), b"first");

        let n = reader.read_record(&mut conn, &mut buf).await.unwrap();
        assert_eq!(n, RECORD_HEADER_SIZE + 7);
        assert_eq!(RecordHeader::body(&buf).unwrap(), b"second!");
    }

    #[tokio::test]
    async fn test_truncated_record_is_unexpected_eof() {
        let wire = record(b"truncated");
        let mut conn: &[u8] = &wire[..wire.len() - 3];

        let mut buf = BytesMut::new();
        let err = TlsRecordReader.read_record(&mut conn, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_non_application_data_rejected() {
        // Handshake record type
        let wire = [0x16, 0x03, 0x03, 0x00, 0x01, 0xAA];
        let mut conn: &[u8] = &wire;

        let mut buf = BytesMut::new();
        let err = TlsRecordReader.read_record(&mut conn, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_body_length_mismatch() {
        let mut buf = record(b"abc");
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            RecordHeader::body(&buf),
            Err(ProtocolError::IncompleteFrame { .. })
        ));
    }
}
