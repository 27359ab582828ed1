//! Control-plane commands sent from the relay to an agent
//!
//! The control connection carries a single command type. Each binary
//! WebSocket message is exactly one command:
//! - 4 bytes: channel ID (big-endian u32)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ChannelId;

/// Encoded length of a channel-open command
pub const CHANNEL_OPEN_LEN: usize = 4;

/// Command errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command length: expected {CHANNEL_OPEN_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Ask the agent to open a data channel tagged with `channel_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelOpen {
    pub channel_id: ChannelId,
}

impl ChannelOpen {
    pub fn new(channel_id: ChannelId) -> Self {
        Self { channel_id }
    }

    /// Encode the command into its wire form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHANNEL_OPEN_LEN);
        buf.put_u32(self.channel_id);
        buf.freeze()
    }

    /// Decode a command from one complete binary message
    pub fn decode(mut data: &[u8]) -> Result<Self, CommandError> {
        if data.len() != CHANNEL_OPEN_LEN {
            return Err(CommandError::InvalidLength(data.len()));
        }
        Ok(Self::new(data.get_u32()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_big_endian() {
        let encoded = ChannelOpen::new(0x0102_0304).encode();
        assert_eq!(&encoded[..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_max_id() {
        let decoded = ChannelOpen::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(decoded.channel_id, u32::MAX);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            ChannelOpen::decode(&[0, 0, 1]),
            Err(CommandError::InvalidLength(3))
        );
        assert_eq!(
            ChannelOpen::decode(&[0, 0, 0, 1, 0]),
            Err(CommandError::InvalidLength(5))
        );
        assert_eq!(ChannelOpen::decode(&[]), Err(CommandError::InvalidLength(0)));
    }
}
