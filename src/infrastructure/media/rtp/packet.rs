//! RTP packet codec (RFC 3550)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Fixed RTP header, CSRC list skipped on parse and never emitted
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub const MIN_HEADER_SIZE: usize = 12;

    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < Self::MIN_HEADER_SIZE {
            return Err(RtpError::PacketTooShort);
        }
        let mut buf = data;

        // Byte 0: V(2), P(1), X(1), CC(4)
        let byte0 = buf.get_u8();
        let version = (byte0 >> 6) & 0x03;
        if version != 2 {
            return Err(RtpError::InvalidVersion(version));
        }
        let padding = (byte0 & 0x20) != 0;
        let extension = (byte0 & 0x10) != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        // Byte 1: M(1), PT(7)
        let byte1 = buf.get_u8();
        let marker = (byte1 & 0x80) != 0;
        let payload_type = byte1 & 0x7F;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(RtpError::PacketTooShort);
        }
        buf.advance(csrc_count * 4);

        if extension {
            if buf.remaining() < 4 {
                return Err(RtpError::PacketTooShort);
            }
            buf.advance(2);
            let ext_len = buf.get_u16() as usize * 4;
            if buf.remaining() < ext_len {
                return Err(RtpError::PacketTooShort);
            }
            buf.advance(ext_len);
        }

        let mut payload_len = buf.remaining();
        if padding {
            if payload_len == 0 {
                return Err(RtpError::InvalidPadding);
            }
            let pad = buf[payload_len - 1] as usize;
            if pad == 0 || pad > payload_len {
                return Err(RtpError::InvalidPadding);
            }
            payload_len -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::MIN_HEADER_SIZE + self.payload.len());
        buf.put_u8(2 << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP[PT={}, Seq={}, TS={}, SSRC={:08x}, Payload={}]",
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RtpError {
    #[error("Packet too short")]
    PacketTooShort,
    #[error("Invalid version: {0}")]
    InvalidVersion(u8),
    #[error("Invalid padding")]
    InvalidPadding,
    #[error("IO error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_parse() {
        let payload = Bytes::from_static(b"voice frame");
        let mut packet = RtpPacket::new(0, 1234, 567890, 0x12345678, payload.clone());
        packet.marker = true;

        let parsed = RtpPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed.payload_type, 0);
        assert_eq!(parsed.sequence, 1234);
        assert_eq!(parsed.timestamp, 567890);
        assert_eq!(parsed.ssrc, 0x12345678);
        assert_eq!(parsed.payload, payload);
        assert!(parsed.marker);
    }

    #[test]
    fn test_parse_skips_csrc_list() {
        let inner = RtpPacket::new(8, 7, 9, 0xAABBCCDD, Bytes::from_static(b"xy"));
        let wire = inner.serialize();
        // Splice two CSRC entries in after the fixed header
        let mut with_csrc = Vec::new();
        with_csrc.push(wire[0] | 0x02);
        with_csrc.extend_from_slice(&wire[1..12]);
        with_csrc.extend_from_slice(&[0x11; 4]);
        with_csrc.extend_from_slice(&[0x22; 4]);
        with_csrc.extend_from_slice(&wire[12..]);

        let parsed = RtpPacket::parse(&with_csrc).unwrap();
        assert_eq!(parsed.payload, Bytes::from_static(b"xy"));
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            RtpPacket::parse(&[0u8; 11]),
            Err(RtpError::PacketTooShort)
        ));
    }

    #[test]
    fn test_invalid_version() {
        let mut data = vec![0u8; 12];
        data[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&data),
            Err(RtpError::InvalidVersion(1))
        ));
    }
}
