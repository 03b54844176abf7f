// Licensed under the Apache-2.0 license

use crate::spdm::length_u16;
use bkps_error::{raise_err, BkpsResult};

/// MCTP message type carried in the first byte of an MCTP command body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MctpMessageType(pub u8);

impl MctpMessageType {
    pub const SPDM: Self = Self(0x05);
    pub const SECURED_SPDM: Self = Self(0x06);
}

const MCTP_HEADER_LEN: usize = 4;

/// SPDM message encapsulated for the MCTP mailbox command. The mailbox
/// pads bodies to whole words, so the header records the payload length:
///
/// ```text
/// | type (1) | reserved (1) | payload length LE (2) | payload |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MctpMessage {
    pub message_type: MctpMessageType,
    pub payload: Vec<u8>,
}

impl MctpMessage {
    pub fn new(message_type: MctpMessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(MCTP_HEADER_LEN + self.payload.len());
        out.push(self.message_type.0);
        out.push(0);
        out.extend_from_slice(&length_u16(self.payload.len(), "MctpMessage payload")?);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Ignores trailing mailbox padding.
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        if bytes.len() < MCTP_HEADER_LEN {
            raise_err!(
                CODEC_BUFFER_TOO_SHORT,
                "MctpMessage should be at least {MCTP_HEADER_LEN} bytes but is {} bytes.",
                bytes.len()
            );
        }
        let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let Some(payload) = bytes.get(MCTP_HEADER_LEN..MCTP_HEADER_LEN + len) else {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "MctpMessage declares {len} payload bytes but carries {}.",
                bytes.len() - MCTP_HEADER_LEN
            );
        };
        Ok(Self {
            message_type: MctpMessageType(bytes[0]),
            payload: payload.to_vec(),
        })
    }
}
