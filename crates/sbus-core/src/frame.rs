//! Frame envelope
//!
//! Every Ether-S-Bus datagram carries one frame:
//!
//! ```text
//!  0  u32  total length, envelope and CRC included
//!  4  u8   version (0)
//!  5  u8   protocol type (0 request, 1 response, 2 ack/nak)
//!  6  u16  sequence, echoed by the responder
//!  8  u8   attribute (0 request, 1 response, 2 ack/nak)
//!  9  ..   payload
//! end u16  CRC-16 over all preceding bytes
//! ```
//!
//! All integers are big-endian. Telegram kind is dispatched on the
//! attribute byte; the protocol type byte mirrors it.

use crate::{crc::crc16, error::CodecError, FRAME_MAX_SIZE, FRAME_MIN_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Envelope version emitted by PCDs and by this implementation.
pub const FRAME_VERSION: u8 = 0;

/// Telegram kind, carried in the attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    /// One acknowledge code byte; 0 is ACK, anything else NAK.
    AckNak,
}

impl FrameKind {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::AckNak),
            _ => None,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::AckNak => 2,
        }
    }
}

/// A decoded frame: kind, message sequence and the command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence: u16,
    pub payload: Bytes,
}

// === impl Frame ===

impl Frame {
    /// Builds a request frame around a command payload.
    pub fn request(sequence: u16, payload: Bytes) -> Self {
        Self { kind: FrameKind::Request, sequence, payload }
    }

    /// Builds a response frame.
    pub fn response(sequence: u16, payload: Bytes) -> Self {
        Self { kind: FrameKind::Response, sequence, payload }
    }

    /// Builds an ack/nak frame carrying a single code byte.
    pub fn ack_nak(sequence: u16, code: u8) -> Self {
        Self { kind: FrameKind::AckNak, sequence, payload: Bytes::copy_from_slice(&[code, 0]) }
    }

    /// Encodes the frame into one datagram, CRC appended.
    pub fn encode(&self) -> Bytes {
        let total = FRAME_MIN_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(total as u32);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.kind.to_wire());
        buf.put_u16(self.sequence);
        buf.put_u8(self.kind.to_wire());
        buf.put_slice(&self.payload);
        let crc = crc16(&buf);
        buf.put_u16(crc);
        buf.freeze()
    }

    /// Decodes and validates one datagram.
    ///
    /// Fails if the size is out of bounds, the declared length disagrees
    /// with the datagram length, the CRC does not check out, or the
    /// attribute byte is unknown.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let size = data.len();
        if !(FRAME_MIN_SIZE..=FRAME_MAX_SIZE).contains(&size) {
            return Err(CodecError::FrameSize(size));
        }

        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared != size {
            return Err(CodecError::LengthMismatch { declared, actual: size });
        }

        let expected = crc16(&data[..size - 2]);
        let actual = u16::from_be_bytes([data[size - 2], data[size - 1]]);
        if expected != actual {
            return Err(CodecError::BadCrc { expected, actual });
        }

        let attribute = data[8];
        let kind =
            FrameKind::from_wire(attribute).ok_or(CodecError::UnknownFrameKind(attribute))?;
        let sequence = u16::from_be_bytes([data[6], data[7]]);
        let payload = Bytes::copy_from_slice(&data[9..size - 2]);

        Ok(Self { kind, sequence, payload })
    }

    /// The ack/nak code, for [`FrameKind::AckNak`] frames.
    pub fn ack_code(&self) -> Option<u8> {
        match self.kind {
            FrameKind::AckNak => self.payload.first().copied(),
            _ => None,
        }
    }
}
