//! Tagged-union message codec. Binary layout (big-endian multi-byte
//! integers):
//!
//! ```text
//! C2C : [0x0_][recipient:16][payload:*]       header nibble=0, type nibble=0
//! C2S : [0x1T][timestamp:4][payload:*]        T in {0, 1, 15}
//! S2S : [0x2T][timestamp:4][payload:*]        T in {14, 15}
//! ```
//!
//! `from_bytes` tolerates unknown type nibbles (and an out-of-range format
//! nibble) by returning `None`; a C2C frame with a nonzero type nibble is
//! also `None`.

use crate::id::ClientId;
use num_enum::TryFromPrimitive;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FORMAT_C2C: u8 = 0;
const FORMAT_C2S: u8 = 1;
const FORMAT_S2S: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum C2SType {
    Heartbeat = 0,
    Config = 1,
    Stop = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum S2SType {
    Done = 14,
    Stop = 15,
}

/// Whole-second timestamp. Construction and wire round-trip both truncate
/// to second resolution, so round-trip identity only holds at that
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(u32);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Timestamp(secs as u32)
    }

    pub fn from_secs(secs: u32) -> Self {
        Timestamp(secs)
    }

    pub fn as_secs(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    C2C {
        recipient: ClientId,
        payload: Vec<u8>,
    },
    C2S {
        ty: C2SType,
        timestamp: Timestamp,
        payload: Option<Vec<u8>>,
    },
    S2S {
        ty: S2SType,
        timestamp: Timestamp,
        payload: Option<Vec<u8>>,
    },
}

impl Message {
    pub fn c2c(recipient: ClientId, payload: Vec<u8>) -> Self {
        Message::C2C { recipient, payload }
    }

    pub fn c2s(ty: C2SType, payload: Option<Vec<u8>>) -> Self {
        Message::C2S {
            ty,
            timestamp: Timestamp::now(),
            payload,
        }
    }

    pub fn s2s(ty: S2SType, payload: Option<Vec<u8>>) -> Self {
        Message::S2S {
            ty,
            timestamp: Timestamp::now(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::C2C { recipient, payload } => {
                let mut out = Vec::with_capacity(17 + payload.len());
                out.push(FORMAT_C2C << 4);
                out.extend_from_slice(&recipient.as_bytes());
                out.extend_from_slice(payload);
                out
            }
            Message::C2S {
                ty,
                timestamp,
                payload,
            } => encode_control(FORMAT_C2S, *ty as u8, *timestamp, payload.as_deref()),
            Message::S2S {
                ty,
                timestamp,
                payload,
            } => encode_control(FORMAT_S2S, *ty as u8, *timestamp, payload.as_deref()),
        }
    }

    pub fn from_bytes(frame: &[u8]) -> Option<Self> {
        let header = *frame.first()?;
        let type_nibble = header & 0x0F;
        let format_nibble = (header & 0xF0) >> 4;

        match format_nibble {
            FORMAT_C2C => {
                if type_nibble != 0 {
                    return None;
                }
                if frame.len() < 17 {
                    return None;
                }
                let recipient_bytes: [u8; 16] = frame[1..17].try_into().ok()?;
                let recipient = ClientId::from_bytes(recipient_bytes);
                let payload = frame[17..].to_vec();
                Some(Message::C2C { recipient, payload })
            }
            FORMAT_C2S => {
                let (timestamp, payload) = decode_control(frame)?;
                let ty = C2SType::try_from_primitive(type_nibble).ok()?;
                Some(Message::C2S {
                    ty,
                    timestamp,
                    payload,
                })
            }
            FORMAT_S2S => {
                let (timestamp, payload) = decode_control(frame)?;
                let ty = S2SType::try_from_primitive(type_nibble).ok()?;
                Some(Message::S2S {
                    ty,
                    timestamp,
                    payload,
                })
            }
            _ => None,
        }
    }

    /// The format nibble, for callers that only need to dispatch on
    /// direction without fully decoding (used by the handler read loop).
    pub fn format(&self) -> &'static str {
        match self {
            Message::C2C { .. } => "C2C",
            Message::C2S { .. } => "C2S",
            Message::S2S { .. } => "S2S",
        }
    }
}

fn encode_control(format: u8, ty: u8, timestamp: Timestamp, payload: Option<&[u8]>) -> Vec<u8> {
    let payload = payload.unwrap_or(&[]);
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push((format << 4) | ty);
    out.extend_from_slice(&timestamp.as_secs().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_control(frame: &[u8]) -> Option<(Timestamp, Option<Vec<u8>>)> {
    if frame.len() < 5 {
        return None;
    }
    let secs = u32::from_be_bytes(frame[1..5].try_into().ok()?);
    let payload = if frame.len() > 5 {
        Some(frame[5..].to_vec())
    } else {
        None
    };
    Some((Timestamp::from_secs(secs), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c2c_roundtrip() {
        let msg = Message::c2c(ClientId::new(), b"ping".to_vec());
        let bytes = msg.to_bytes();
        assert_eq!(Message::from_bytes(&bytes), Some(msg));
    }

    #[test]
    fn c2c_roundtrip_empty_payload() {
        let msg = Message::c2c(ClientId::new(), Vec::new());
        let bytes = msg.to_bytes();
        assert_eq!(Message::from_bytes(&bytes), Some(msg));
    }

    #[test]
    fn c2c_nonzero_type_nibble_is_none() {
        let mut bytes = Message::c2c(ClientId::new(), b"x".to_vec()).to_bytes();
        bytes[0] |= 0x01; // corrupt the type nibble
        assert_eq!(Message::from_bytes(&bytes), None);
    }

    #[test]
    fn c2s_heartbeat_roundtrip_truncates_to_seconds() {
        let msg = Message::c2s(C2SType::Heartbeat, None);
        let bytes = msg.to_bytes();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn c2s_with_payload_roundtrip() {
        let msg = Message::c2s(C2SType::Config, Some(b"{\"port\":4000}".to_vec()));
        let bytes = msg.to_bytes();
        assert_eq!(Message::from_bytes(&bytes), Some(msg));
    }

    #[test]
    fn s2s_stop_roundtrip() {
        let msg = Message::s2s(S2SType::Stop, None);
        let bytes = msg.to_bytes();
        assert_eq!(Message::from_bytes(&bytes), Some(msg));
    }

    #[test]
    fn unknown_c2s_type_nibble_is_none() {
        let mut bytes = Message::c2s(C2SType::Heartbeat, None).to_bytes();
        bytes[0] = (FORMAT_C2S << 4) | 0x07; // 7 is not a valid C2SType
        assert_eq!(Message::from_bytes(&bytes), None);
    }

    #[test]
    fn empty_frame_is_none() {
        assert_eq!(Message::from_bytes(&[]), None);
    }

    #[test]
    fn zero_payload_s2s_has_no_payload() {
        let msg = Message::s2s(S2SType::Done, None);
        let decoded = Message::from_bytes(&msg.to_bytes()).unwrap();
        match decoded {
            Message::S2S { payload, .. } => assert_eq!(payload, None),
            _ => panic!("expected S2S"),
        }
    }
}
