//! Binary frame format.
//!
//! Every message travels in one frame (16 byte header + JSON payload):
//!
//! ```text
//! +--------+---------+--------+-------------+--------+---------------+
//! | magic  | version | flags  | payload_len | crc32c | payload       |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes| payload_len   |
//! +--------+---------+--------+-------------+--------+---------------+
//! ```
//!
//! All integers are big-endian. The checksum covers the payload only.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "TSMP"
pub const MAGIC: [u8; 4] = *b"TSMP";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// The crc32c field is set and must be checked.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_MASK: u16 = Self::CRC_PRESENT;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// The fixed-size part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub flags: FrameFlags,
    pub payload_len: u32,
    pub crc: u32,
}

impl FrameHeader {
    /// Reads and checks a header. `bytes` must hold at least
    /// [`FRAME_HEADER_SIZE`] bytes.
    pub fn parse(mut bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut magic = [0u8; 4];
        bytes.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = bytes.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let flags = FrameFlags::from_bits(bytes.get_u16())?;

        // Checked here so a bogus length never makes the reader buffer it.
        let payload_len = bytes.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            version,
            flags,
            payload_len,
            crc: bytes.get_u32(),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.payload_len);
        buf.put_u32(self.crc);
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }

    fn verify(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        if !self.flags.has_crc() {
            return Ok(());
        }
        match crc32c::crc32c(payload) {
            actual if actual == self.crc => Ok(()),
            actual => Err(ProtocolError::CrcMismatch {
                expected: self.crc,
                actual,
            }),
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// JSON payload.
    pub payload: Bytes,
}

impl Frame {
    /// Checksummed frame at the current protocol version.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::to_vec(value)
            .map(|payload| Self::new(Bytes::from(payload)))
            .map_err(ProtocolError::from)
    }

    fn header(&self) -> Result<FrameHeader, ProtocolError> {
        let too_large = || ProtocolError::FrameTooLarge {
            size: self.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        };
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| too_large())?;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(too_large());
        }
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        Ok(FrameHeader {
            version: self.version,
            flags: self.flags,
            payload_len,
            crc,
        })
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let header = self.header()?;
        let mut buf = BytesMut::with_capacity(header.frame_len());
        header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Takes one frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// buffered. A bad header is reported as soon as its 16 bytes arrive.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE])?;
        if buf.len() < header.frame_len() {
            return Ok(None);
        }

        let mut frame = buf.split_to(header.frame_len());
        frame.advance(FRAME_HEADER_SIZE);
        let payload = frame.freeze();
        header.verify(&payload)?;

        Ok(Some(Self {
            version: header.version,
            flags: header.flags,
            payload,
        }))
    }
}
