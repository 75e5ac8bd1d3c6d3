//! Wire format for data packets and acknowledgements.
//!
//! ```text
//! data packet:  [seq: u16 LE][flag: u8, 0x01 = EOF][payload: <= 1024 bytes]
//! ack:          [seq: u16 LE]
//! ```
//!
//! With integrity checking enabled both frames gain a trailing big-endian
//! Internet checksum computed over everything before it.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{internet_checksum, verify};

/// Fixed data-packet header: two sequence bytes plus the flag byte.
pub const HEADER_LEN: usize = 3;
/// Bare acknowledgement length.
pub const ACK_LEN: usize = 2;
/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = 1024;
/// Receive buffer size used by every driver.
pub const MAX_DATAGRAM: usize = 2048;
/// Length of the optional checksum trailer.
pub const CHECKSUM_LEN: usize = 2;

/// Flag byte values.
pub mod flags {
    pub const DATA: u8 = 0x00;
    pub const EOF: u8 = 0x01;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: {len} bytes, need at least {need}")]
    Truncated { len: usize, need: usize },
    #[error("payload of {0} bytes exceeds the 1024 byte limit")]
    PayloadTooLarge(usize),
    #[error("checksum mismatch (stored {stored:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

/// Encoding options shared by both endpoints of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    pub integrity: bool,
}

impl Codec {
    pub fn new(integrity: bool) -> Self {
        Self { integrity }
    }

    fn trailer_len(&self) -> usize {
        if self.integrity { CHECKSUM_LEN } else { 0 }
    }

    fn seal(&self, mut buf: BytesMut) -> Bytes {
        if self.integrity {
            let sum = internet_checksum(&buf);
            buf.put_u16(sum);
        }
        buf.freeze()
    }

    /// Strip and verify the trailer, returning the framed body.
    fn open<'a>(&self, buf: &'a [u8], min_body: usize) -> Result<&'a [u8], PacketError> {
        let need = min_body + self.trailer_len();
        if buf.len() < need {
            return Err(PacketError::Truncated {
                len: buf.len(),
                need,
            });
        }
        if !self.integrity {
            return Ok(buf);
        }
        let (body, trailer) = buf.split_at(buf.len() - CHECKSUM_LEN);
        let stored = u16::from_be_bytes([trailer[0], trailer[1]]);
        if !verify(body, stored) {
            return Err(PacketError::ChecksumMismatch {
                stored,
                computed: internet_checksum(body),
            });
        }
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Wire sequence number (already reduced by the sequence modulus).
    pub seq: u16,
    pub eof: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(seq: u16, eof: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            eof,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self, codec: &Codec) -> Result<Bytes, PacketError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + self.payload.len() + codec.trailer_len());
        buf.put_u16_le(self.seq);
        buf.put_u8(if self.eof { flags::EOF } else { flags::DATA });
        buf.put_slice(&self.payload);
        Ok(codec.seal(buf))
    }

    pub fn decode(codec: &Codec, buf: &[u8]) -> Result<Self, PacketError> {
        let body = codec.open(buf, HEADER_LEN)?;
        Ok(Self {
            seq: u16::from_le_bytes([body[0], body[1]]),
            eof: body[2] == flags::EOF,
            payload: Bytes::copy_from_slice(&body[HEADER_LEN..]),
        })
    }
}

/// Acknowledgement echoing a packet's wire sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack {
    pub seq: u16,
}

impl Ack {
    pub fn new(seq: u16) -> Self {
        Self { seq }
    }

    pub fn encode(&self, codec: &Codec) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_LEN + codec.trailer_len());
        buf.put_u16_le(self.seq);
        codec.seal(buf)
    }

    pub fn decode(codec: &Codec, buf: &[u8]) -> Result<Self, PacketError> {
        let body = codec.open(buf, ACK_LEN)?;
        Ok(Self {
            seq: u16::from_le_bytes([body[0], body[1]]),
        })
    }
}

/// Read the wire sequence number of a data packet or ack without decoding
/// the rest. Used by channels that inject faults keyed on sequence numbers.
pub fn peek_seq(buf: &[u8]) -> Option<u16> {
    match buf {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}
