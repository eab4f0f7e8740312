//! Frame framing and serialization.
//!
//! Wire format (big-endian):
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Version (1) │ Flags (1) │ Seq (4)  │ Ack (4)             │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload Len (2)         │ Checksum (2)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Payload (0..=1400)                                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum is the Internet Checksum over the entire frame with the
//! checksum field zeroed. No I/O happens here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::checksum;
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Frame carries application payload.
    pub const DATA: u8 = 0x01;
    /// Acknowledgment field is valid.
    pub const ACK: u8 = 0x02;
    /// Connection setup.
    pub const SYN: u8 = 0x04;
    /// Connection teardown.
    pub const FIN: u8 = 0x08;
}

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 14;

const CHECKSUM_OFFSET: usize = 12;

/// One transport protocol data unit.
///
/// The version byte is fixed and the payload length and checksum are
/// derived at encode time, so only the meaningful fields are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Bitmask of [`flags`] constants. A well-formed frame has at least
    /// one bit set.
    pub flags: u8,
    /// Sequence number of this frame.
    pub seq: u32,
    /// Acknowledgment number (next sequence expected from the peer).
    pub ack: u32,
    /// Application payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a DATA frame.
    pub fn data(seq: u32, ack: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: flags::DATA,
            seq,
            ack,
            payload: payload.into(),
        }
    }

    /// Create a bare acknowledgment.
    pub fn ack(seq: u32, ack: u32) -> Self {
        Self {
            flags: flags::ACK,
            seq,
            ack,
            payload: Bytes::new(),
        }
    }

    /// Create a connection-setup frame.
    pub fn syn(seq: u32) -> Self {
        Self {
            flags: flags::SYN,
            seq,
            ack: 0,
            payload: Bytes::new(),
        }
    }

    /// Create the responder's half of the setup exchange.
    pub fn syn_ack(seq: u32, ack: u32) -> Self {
        Self {
            flags: flags::SYN | flags::ACK,
            seq,
            ack,
            payload: Bytes::new(),
        }
    }

    /// Create a teardown frame.
    pub fn fin(seq: u32, ack: u32) -> Self {
        Self {
            flags: flags::FIN,
            seq,
            ack,
            payload: Bytes::new(),
        }
    }

    /// Check whether a flag bit is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the frame, computing and embedding the checksum.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u16(0); // checksum slot, filled below
        buf.put_slice(&self.payload);

        let sum = checksum::checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());

        buf.freeze()
    }

    /// Deserialize and validate a frame.
    ///
    /// Any validation failure means the frame is indistinguishable from
    /// line noise; callers drop it and rely on retransmission.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::frame(format!(
                "short frame: {} bytes, header needs {HEADER_SIZE}",
                buf.len()
            )));
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::frame(format!("unsupported version: {version:#04x}")));
        }

        let frame_flags = buf[1];
        if frame_flags == 0 {
            return Err(Error::frame("no flags set"));
        }

        let seq = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let ack = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let payload_len = u16::from_be_bytes([buf[10], buf[11]]) as usize;
        let received_sum = u16::from_be_bytes([buf[12], buf[13]]);

        if payload_len != buf.len() - HEADER_SIZE {
            return Err(Error::frame(format!(
                "length mismatch: header says {payload_len}, frame carries {}",
                buf.len() - HEADER_SIZE
            )));
        }

        // Recompute with the checksum field zeroed. The field sits on a word
        // boundary, so summing around it matches the zeroed computation.
        let computed = checksum::checksum_parts(&[&buf[..CHECKSUM_OFFSET], &buf[HEADER_SIZE..]]);
        if computed != received_sum {
            return Err(Error::frame(format!(
                "checksum mismatch: expected {received_sum:#06x}, computed {computed:#06x}"
            )));
        }

        Ok(Self {
            flags: frame_flags,
            seq,
            ack,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.has_flag(flags::DATA) {
            names.push("DATA");
        }
        if self.has_flag(flags::ACK) {
            names.push("ACK");
        }
        if self.has_flag(flags::SYN) {
            names.push("SYN");
        }
        if self.has_flag(flags::FIN) {
            names.push("FIN");
        }
        write!(
            f,
            "[{}] seq={} ack={} len={}",
            names.join("|"),
            self.seq,
            self.ack,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let original = Frame::data(42, 7, Bytes::from_static(b"hello world"));
        let encoded = original.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 11);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        for frame in [
            Frame::ack(1, 5),
            Frame::syn(1000),
            Frame::syn_ack(2000, 1001),
            Frame::fin(3, 9),
        ] {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut encoded = BytesMut::from(&Frame::ack(0, 1).encode()[..]);
        encoded[0] = 0x02;
        assert!(Frame::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_zero_flags() {
        // Build a frame with no flags and a correct checksum; the flag
        // check must still reject it.
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(0);
        buf.put_u16(0);
        let sum = checksum::checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());

        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let encoded = Frame::data(1, 0, Bytes::from_static(b"abcdef")).encode();
        // Truncating the payload breaks the declared length.
        assert!(Frame::decode(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn test_single_bit_corruption_detected() {
        let encoded = Frame::data(9, 3, Bytes::from_static(b"checksummed payload")).encode();

        for byte in 0..encoded.len() {
            for bit in 0..8 {
                let mut copy = BytesMut::from(&encoded[..]);
                copy[byte] ^= 1 << bit;
                // Flips in the version, flags, or length field fail their own
                // checks; everything else must fail the checksum.
                assert!(
                    Frame::decode(&copy).is_err(),
                    "bit {bit} of byte {byte} slipped through"
                );
            }
        }
    }

    #[test]
    fn test_rezeroed_checksum_rejected() {
        let encoded = Frame::data(1, 2, Bytes::from_static(b"some payload")).encode();
        let mut copy = BytesMut::from(&encoded[..]);
        let had_nonzero_sum = copy[CHECKSUM_OFFSET] != 0 || copy[CHECKSUM_OFFSET + 1] != 0;
        copy[CHECKSUM_OFFSET] = 0;
        copy[CHECKSUM_OFFSET + 1] = 0;

        if had_nonzero_sum {
            assert!(Frame::decode(&copy).is_err());
        }
    }

    #[test]
    fn test_max_payload_round_trip() {
        let payload = vec![0xA5u8; MAX_PAYLOAD_SIZE];
        let frame = Frame::data(u32::MAX, u32::MAX, payload);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(decoded.seq, u32::MAX);
    }

    #[test]
    fn test_flag_combinations() {
        let frame = Frame::syn_ack(5, 6);
        assert!(frame.has_flag(flags::SYN));
        assert!(frame.has_flag(flags::ACK));
        assert!(!frame.has_flag(flags::DATA));
        assert!(!frame.has_flag(flags::FIN));
    }

    #[test]
    fn test_display_names_flags() {
        let text = Frame::syn_ack(1, 2).to_string();
        assert!(text.contains("SYN|ACK"));
    }
}
