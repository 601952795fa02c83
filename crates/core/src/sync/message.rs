use serde::{Deserialize, Serialize};

use crate::{Result, RhythmSyncError};

const TAG_REQUEST: u8 = 0x01;
const TAG_REQUESTED: u8 = 0x02;
const TAG_PERIODIC: u8 = 0x03;

/// Host timeline position stamped with the shared network time at which it
/// was captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimelineSyncMessage {
    /// May already include the host's network anticipation.
    pub timeline_position_ms: i32,
    pub host_timestamp: f64,
}

impl TimelineSyncMessage {
    pub const ENCODED_LEN: usize = 12;

    /// Little-endian `i32` position followed by `f64` timestamp.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.timeline_position_ms.to_le_bytes());
        out[4..].copy_from_slice(&self.host_timestamp.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(RhythmSyncError::Decode("sync message must be 12 bytes"));
        }
        let mut position = [0u8; 4];
        let mut timestamp = [0u8; 8];
        position.copy_from_slice(&bytes[..4]);
        timestamp.copy_from_slice(&bytes[4..]);

        let host_timestamp = f64::from_le_bytes(timestamp);
        if !host_timestamp.is_finite() {
            return Err(RhythmSyncError::Decode("host timestamp is not finite"));
        }
        Ok(Self {
            timeline_position_ms: i32::from_le_bytes(position),
            host_timestamp,
        })
    }
}

/// Why a sync message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// Reply to a client's explicit request. Always applied.
    Requested,
    /// Regular once-per-bar broadcast. Applied only beyond tolerance.
    Periodic,
}

/// Everything exchanged between host and clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncPacket {
    Request,
    Sync {
        kind: SyncKind,
        message: TimelineSyncMessage,
    },
}

impl SyncPacket {
    pub fn requested(message: TimelineSyncMessage) -> Self {
        Self::Sync {
            kind: SyncKind::Requested,
            message,
        }
    }

    pub fn periodic(message: TimelineSyncMessage) -> Self {
        Self::Sync {
            kind: SyncKind::Periodic,
            message,
        }
    }

    /// One tag byte, followed by the 12-byte message for sync packets.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Request => vec![TAG_REQUEST],
            Self::Sync { kind, message } => {
                let tag = match kind {
                    SyncKind::Requested => TAG_REQUESTED,
                    SyncKind::Periodic => TAG_PERIODIC,
                };
                let mut out = Vec::with_capacity(1 + TimelineSyncMessage::ENCODED_LEN);
                out.push(tag);
                out.extend_from_slice(&message.encode());
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or(RhythmSyncError::Decode("empty packet"))?;

        let kind = match tag {
            TAG_REQUEST if body.is_empty() => return Ok(Self::Request),
            TAG_REQUEST => return Err(RhythmSyncError::Decode("request carries a body")),
            TAG_REQUESTED => SyncKind::Requested,
            TAG_PERIODIC => SyncKind::Periodic,
            _ => return Err(RhythmSyncError::Decode("unknown packet tag")),
        };
        Ok(Self::Sync {
            kind,
            message: TimelineSyncMessage::decode(body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout_is_little_endian() {
        let message = TimelineSyncMessage {
            timeline_position_ms: 1025,
            host_timestamp: 2.5,
        };
        let bytes = message.encode();
        assert_eq!(&bytes[..4], &1025i32.to_le_bytes());
        assert_eq!(&bytes[4..], &2.5f64.to_le_bytes());
        assert_eq!(TimelineSyncMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn packets_carry_their_kind() {
        let message = TimelineSyncMessage {
            timeline_position_ms: -3,
            host_timestamp: 10.0,
        };
        let periodic = SyncPacket::periodic(message).encode();
        assert_eq!(periodic.len(), 13);
        assert_eq!(SyncPacket::decode(&periodic).unwrap(), SyncPacket::periodic(message));
        assert_eq!(SyncPacket::decode(&[TAG_REQUEST]).unwrap(), SyncPacket::Request);
    }

    #[test]
    fn rejects_malformed_packets() {
        assert!(SyncPacket::decode(&[]).is_err());
        assert!(SyncPacket::decode(&[0x7f]).is_err());
        assert!(SyncPacket::decode(&[TAG_REQUEST, 0]).is_err());
        assert!(SyncPacket::decode(&[TAG_PERIODIC, 1, 2, 3]).is_err());

        let mut nan = vec![TAG_PERIODIC];
        nan.extend_from_slice(&0i32.to_le_bytes());
        nan.extend_from_slice(&f64::NAN.to_le_bytes());
        assert!(matches!(
            SyncPacket::decode(&nan),
            Err(RhythmSyncError::Decode(_))
        ));
    }
}
