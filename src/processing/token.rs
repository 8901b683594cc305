//! Discovery-token exchange codec
//!
//! Frames carried over the peer channel:
//! `[magic "RT"(2)] [version(1)] [kind(1)] [length(2)] [payload(length)] [crc16(2)]`
//! with little-endian integers. Anything that does not parse is foreign
//! traffic and is dropped by the caller without further effect.

use crate::core::{Destination, PeerDescriptor, PeerId};
use crate::transport::{LinkBackend, PeerTransport, Reliability, TransportResult};
use std::fmt;
use thiserror::Error;

const MAGIC: [u8; 2] = *b"RT";
const FRAME_VERSION: u8 = 1;
const HEADER_SIZE: usize = 6;
const CHECKSUM_SIZE: usize = 2;

const KIND_DISCOVERY_TOKEN: u8 = 1;
const KIND_DESTINATION_UPDATE: u8 = 2;

/// Opaque ranging discovery token produced by the ranging capability
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryToken(Vec<u8>);

impl DiscoveryToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        DiscoveryToken(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DiscoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryToken({} bytes)", self.0.len())
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Sender's discovery token for the receiving peer
    DiscoveryToken(DiscoveryToken),
    /// Sender's destination changed after the handshake
    DestinationUpdate(Destination),
}

/// Errors that can occur while decoding a frame
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("insufficient data: need {required} bytes, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("not a ranging frame")]
    BadMagic,
    #[error("unsupported frame version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("unknown frame kind: {kind}")]
    UnknownKind { kind: u8 },
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    InvalidChecksum { expected: u16, actual: u16 },
    #[error("empty discovery token")]
    EmptyToken,
    #[error("unknown destination code: {code}")]
    InvalidDestination { code: u8 },
    #[error("frame is not a discovery token")]
    NotAToken,
    #[error("invalid peer descriptor: {details}")]
    InvalidDescriptor { details: String },
}

/// Errors that can occur while encoding a frame
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },
}

/// CRC16 (Modbus polynomial) over `data`
pub fn checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

fn frame(kind: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let length = u16::try_from(payload.len()).map_err(|_| EncodeError::PayloadTooLarge {
        size: payload.len(),
        max: u16::MAX as usize,
    })?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    data.extend_from_slice(&MAGIC);
    data.push(FRAME_VERSION);
    data.push(kind);
    data.extend_from_slice(&length.to_le_bytes());
    data.extend_from_slice(payload);
    let crc = checksum(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Encode any wire message into a frame
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, EncodeError> {
    match message {
        WireMessage::DiscoveryToken(token) => frame(KIND_DISCOVERY_TOKEN, token.as_bytes()),
        WireMessage::DestinationUpdate(destination) => {
            frame(KIND_DESTINATION_UPDATE, &[destination.code()])
        }
    }
}

/// Decode a frame into a wire message
pub fn decode_message(data: &[u8]) -> Result<WireMessage, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::InsufficientData {
            required: HEADER_SIZE,
            available: data.len(),
        });
    }
    if data[0..2] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if data[2] != FRAME_VERSION {
        return Err(DecodeError::UnsupportedVersion { version: data[2] });
    }

    let kind = data[3];
    let length = u16::from_le_bytes([data[4], data[5]]) as usize;
    let required = HEADER_SIZE + length + CHECKSUM_SIZE;
    if data.len() < required {
        return Err(DecodeError::InsufficientData {
            required,
            available: data.len(),
        });
    }

    let body_end = HEADER_SIZE + length;
    let expected = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
    let actual = checksum(&data[..body_end]);
    if expected != actual {
        return Err(DecodeError::InvalidChecksum { expected, actual });
    }

    let payload = &data[HEADER_SIZE..body_end];
    match kind {
        KIND_DISCOVERY_TOKEN => {
            if payload.is_empty() {
                return Err(DecodeError::EmptyToken);
            }
            Ok(WireMessage::DiscoveryToken(DiscoveryToken::new(payload)))
        }
        KIND_DESTINATION_UPDATE => {
            let code = payload.first().copied().ok_or(DecodeError::InsufficientData {
                required: HEADER_SIZE + 1 + CHECKSUM_SIZE,
                available: data.len(),
            })?;
            Destination::from_code(code)
                .map(WireMessage::DestinationUpdate)
                .ok_or(DecodeError::InvalidDestination { code })
        }
        other => Err(DecodeError::UnknownKind { kind: other }),
    }
}

/// Encode a discovery token
pub fn encode(token: &DiscoveryToken) -> Result<Vec<u8>, EncodeError> {
    encode_message(&WireMessage::DiscoveryToken(token.clone()))
}

/// Decode a discovery token, rejecting every other frame kind
pub fn decode(data: &[u8]) -> Result<DiscoveryToken, DecodeError> {
    match decode_message(data)? {
        WireMessage::DiscoveryToken(token) => Ok(token),
        _ => Err(DecodeError::NotAToken),
    }
}

/// Ship our token to `peer` with reliable delivery
pub fn share<B: LinkBackend>(
    transport: &mut PeerTransport<B>,
    token: &DiscoveryToken,
    peer: &PeerId,
) -> TransportResult<()> {
    let data = encode(token).map_err(|error| crate::transport::TransportError::SendFailed {
        details: error.to_string(),
    })?;
    transport.send(std::slice::from_ref(peer), &data, Reliability::Reliable)
}

/// Serialize the handshake descriptor attached to advertisements and invitations
pub fn encode_descriptor(descriptor: &PeerDescriptor) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(descriptor)
}

/// Parse a handshake descriptor received from a remote device
pub fn decode_descriptor(data: &[u8]) -> Result<PeerDescriptor, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError::InvalidDescriptor {
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    #[test]
    fn test_token_frame_layout() {
        let token = DiscoveryToken::new(vec![0xAA, 0xBB, 0xCC]);
        let data = encode(&token).unwrap();

        assert_eq!(&data[0..2], b"RT");
        assert_eq!(data[2], FRAME_VERSION);
        assert_eq!(data[3], KIND_DISCOVERY_TOKEN);
        assert_eq!(u16::from_le_bytes([data[4], data[5]]), 3);
        assert_eq!(data.len(), HEADER_SIZE + 3 + CHECKSUM_SIZE);
        assert_eq!(decode(&data).unwrap(), token);
    }

    #[test]
    fn test_foreign_payloads_are_rejected() {
        assert!(matches!(
            decode(b"hi"),
            Err(DecodeError::InsufficientData { .. })
        ));
        assert_eq!(decode(b"{\"json\": true}"), Err(DecodeError::BadMagic));

        let mut data = encode(&DiscoveryToken::new(vec![1, 2, 3, 4])).unwrap();
        let last = data.len() - 3;
        data[last] ^= 0xFF;
        assert!(matches!(decode(&data), Err(DecodeError::InvalidChecksum { .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let data = encode(&DiscoveryToken::new(vec![9; 32])).unwrap();
        assert!(matches!(
            decode(&data[..20]),
            Err(DecodeError::InsufficientData { required: 40, available: 20 })
        ));
    }

    #[test]
    fn test_destination_update_is_not_a_token() {
        let data = encode_message(&WireMessage::DestinationUpdate(Destination::Kitchen)).unwrap();
        assert_eq!(
            decode_message(&data).unwrap(),
            WireMessage::DestinationUpdate(Destination::Kitchen)
        );
        assert_eq!(decode(&data), Err(DecodeError::NotAToken));
    }

    #[test]
    fn test_oversized_token() {
        let token = DiscoveryToken::new(vec![0; 70_000]);
        assert!(matches!(encode(&token), Err(EncodeError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_descriptor_handshake() {
        let descriptor = PeerDescriptor::new(Role::Anchor, "u1", "Window Anchor")
            .with_destination(Destination::Window);
        let data = encode_descriptor(&descriptor).unwrap();
        assert_eq!(decode_descriptor(&data).unwrap(), descriptor);
        assert!(decode_descriptor(b"anchor-u1").is_err());
    }

    #[test]
    fn test_checksum_known_value() {
        // CRC-16/MODBUS check value
        assert_eq!(checksum(b"123456789"), 0x4B37);
    }
}
