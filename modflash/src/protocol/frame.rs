//! Wire frame codec.
//!
//! Every packet travels as one compact JSON object over the serial link:
//!
//! ```text
//! {"c":13,"s":513,"d":2748,"b":"qrvM3QAAAAA=","l":8}
//! ```
//!
//! `c` is the 8-bit command, `s` and `d` are 12-bit source/destination ids,
//! `b` is the base64-encoded payload (0..=8 bytes) and `l` its length. The
//! encoding must match the module firmware's frame parser byte for byte,
//! including key order and the `l` field.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Destination id addressing all modules on the link.
pub const BROADCAST_ID: u16 = 0xFFF;

/// Maximum payload length of a packet.
pub const MAX_PAYLOAD: usize = 8;

/// A logical packet exchanged with a module.
///
/// Invariants: `sid` and `did` fit in 12 bits, `data.len() <= 8`. These are
/// upheld by every builder in [`crate::protocol::bootloader`]; `decode`
/// rejects frames that violate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command opcode.
    pub cmd: u8,
    /// Source / sub id (12 bits).
    pub sid: u16,
    /// Destination id (12 bits).
    pub did: u16,
    /// Payload, at most 8 bytes.
    pub data: Vec<u8>,
}

/// On-the-wire JSON shape. Field order matters: the device firmware emits
/// and expects `c`, `s`, `d`, `b`, `l`.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    c: u8,
    s: u16,
    d: u16,
    b: String,
    l: Option<usize>,
}

impl Packet {
    /// Create a new packet.
    pub fn new(cmd: u8, sid: u16, did: u16, data: Vec<u8>) -> Self {
        debug_assert!(sid <= BROADCAST_ID && did <= BROADCAST_ID);
        debug_assert!(data.len() <= MAX_PAYLOAD);
        Self {
            cmd,
            sid,
            did,
            data,
        }
    }

    /// Encode into the wire JSON text.
    #[allow(clippy::unwrap_used)] // Serializing integers and a string cannot fail
    pub fn encode(&self) -> String {
        let frame = WireFrame {
            c: self.cmd,
            s: self.sid,
            d: self.did,
            b: BASE64.encode(&self.data),
            l: Some(self.data.len()),
        };
        serde_json::to_string(&frame).unwrap()
    }

    /// Decode a packet from one wire JSON object.
    pub fn decode(text: &str) -> Result<Self> {
        let frame: WireFrame =
            serde_json::from_str(text).map_err(|e| Error::Frame(e.to_string()))?;

        let data = BASE64
            .decode(frame.b.as_bytes())
            .map_err(|e| Error::Frame(format!("bad payload encoding: {e}")))?;

        if frame.s > BROADCAST_ID || frame.d > BROADCAST_ID {
            return Err(Error::Frame(format!(
                "id out of range: s={:#X} d={:#X}",
                frame.s, frame.d
            )));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(Error::Frame(format!("payload too long: {}", data.len())));
        }
        if let Some(l) = frame.l {
            if l != data.len() {
                return Err(Error::Frame(format!(
                    "length field {l} does not match payload of {}",
                    data.len()
                )));
            }
        }

        Ok(Self {
            cmd: frame.c,
            sid: frame.s,
            did: frame.d,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_basic() {
        let pkt = Packet::new(0x0D, 0x201, 0xABC, vec![0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 0]);
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn test_round_trip_boundaries() {
        for cmd in [0x00u8, 0x05, 0x28, 0x7F, 0xA4, 0xFF] {
            for id in [0u16, 1, 0x7FF, 0xFFE, 0xFFF] {
                for len in 0..=MAX_PAYLOAD {
                    let data: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
                    let pkt = Packet::new(cmd, id, id, data);
                    assert_eq!(Packet::decode(&pkt.encode()).unwrap(), pkt);
                }
            }
        }
    }

    #[test]
    fn test_encode_key_order_and_length_field() {
        let pkt = Packet::new(0x28, 0xFFF, 0xFFF, vec![0xFF, 0xFF]);
        let text = pkt.encode();
        assert_eq!(text, r#"{"c":40,"s":4095,"d":4095,"b":"//8=","l":2}"#);
    }

    #[test]
    fn test_decode_without_length_field() {
        let pkt = Packet::decode(r#"{"c":5,"s":1,"d":2,"b":"AAE="}"#).unwrap();
        assert_eq!(pkt.data, vec![0x00, 0x01]);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        assert!(Packet::decode(r#"{"c":5,"s":1,"d":2,"b":"AAE=","l":3}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_wide_ids() {
        assert!(Packet::decode(r#"{"c":5,"s":4096,"d":2,"b":"","l":0}"#).is_err());
        assert!(Packet::decode(r#"{"c":5,"s":2,"d":4096,"b":"","l":0}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        // 9 bytes of payload
        assert!(Packet::decode(r#"{"c":5,"s":1,"d":2,"b":"AAAAAAAAAAAA","l":9}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Packet::decode("{not json}").is_err());
        assert!(Packet::decode(r#"{"c":5,"s":1,"d":2,"b":"@@@@","l":3}"#).is_err());
    }

    #[test]
    fn test_unknown_cmd_still_decodes() {
        // Unknown opcodes are the protocol layer's problem, not the codec's.
        let pkt = Packet::decode(r#"{"c":250,"s":0,"d":0,"b":"","l":0}"#).unwrap();
        assert_eq!(pkt.cmd, 250);
    }
}
