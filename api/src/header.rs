// Licensed under the Apache-2.0 license

use crate::read_u32_le;
use bkps_error::{BkpsError, BkpsResult, ErrorKind};

pub const COMMAND_HEADER_LEN: usize = 4;

const CODE_BITS: u32 = 11;
const LENGTH_SHIFT: u32 = 12;
const LENGTH_BITS: u32 = 11;
const ID_SHIFT: u32 = 24;
const CLIENT_SHIFT: u32 = 28;
const NIBBLE_MASK: u32 = 0xF;

const fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

/// Byte order of a mailbox word depends on which side produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndiannessActor {
    /// Device firmware, words are little-endian.
    Firmware,
    /// Service side, words are big-endian.
    Service,
}

impl EndiannessActor {
    pub fn to_bytes(self, word: u32) -> [u8; 4] {
        match self {
            EndiannessActor::Firmware => word.to_le_bytes(),
            EndiannessActor::Service => word.to_be_bytes(),
        }
    }

    pub fn from_bytes(self, bytes: [u8; 4]) -> u32 {
        match self {
            EndiannessActor::Firmware => u32::from_le_bytes(bytes),
            EndiannessActor::Service => u32::from_be_bytes(bytes),
        }
    }
}

/// Mailbox command header word
///
/// ```text
///  31..28   27..24   23   22..12     11   10..0
/// [client] [  id  ] [r] [arg len] [r] [ code ]
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub client: u8,
    pub id: u8,
    /// Argument length in 32-bit words.
    pub arg_len: u16,
    /// Command code in requests, status code in responses.
    pub code: u16,
}

impl CommandHeader {
    pub fn new(code: u16, arg_len: u16, client: u8, id: u8) -> Self {
        Self {
            client,
            id,
            arg_len,
            code,
        }
    }

    pub fn to_u32(&self) -> u32 {
        ((self.client as u32 & NIBBLE_MASK) << CLIENT_SHIFT)
            | ((self.id as u32 & NIBBLE_MASK) << ID_SHIFT)
            | ((self.arg_len as u32 & mask(LENGTH_BITS)) << LENGTH_SHIFT)
            | (self.code as u32 & mask(CODE_BITS))
    }

    pub fn from_u32(word: u32) -> Self {
        Self {
            client: ((word >> CLIENT_SHIFT) & NIBBLE_MASK) as u8,
            id: ((word >> ID_SHIFT) & NIBBLE_MASK) as u8,
            arg_len: ((word >> LENGTH_SHIFT) & mask(LENGTH_BITS)) as u16,
            code: (word & mask(CODE_BITS)) as u16,
        }
    }

    pub fn encode(&self, actor: EndiannessActor) -> [u8; COMMAND_HEADER_LEN] {
        actor.to_bytes(self.to_u32())
    }

    pub fn decode(bytes: &[u8], actor: EndiannessActor) -> BkpsResult<Self> {
        let word = match actor {
            EndiannessActor::Firmware => read_u32_le(bytes, 0),
            EndiannessActor::Service => bytes
                .get(..COMMAND_HEADER_LEN)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        };
        word.map(Self::from_u32).ok_or_else(|| {
            BkpsError::new(
                ErrorKind::CODEC_BUFFER_TOO_SHORT,
                format!(
                    "Command header requires {COMMAND_HEADER_LEN} bytes but {} provided.",
                    bytes.len()
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_service_actor() {
        let header = CommandHeader::new(0, 180, 1, 1);
        assert_eq!(header.encode(EndiannessActor::Service), [17, 11, 64, 0]);
    }

    #[test]
    fn test_encode_firmware_actor() {
        let header = CommandHeader::new(0, 180, 1, 1);
        assert_eq!(header.encode(EndiannessActor::Firmware), [0, 64, 11, 17]);
    }

    #[test]
    fn test_decode_firmware_response() {
        // AAUAEA== from a device that failed GET_DEVICE_IDENTITY
        let header = CommandHeader::decode(&[0x00, 0x05, 0x00, 0x10], EndiannessActor::Firmware)
            .unwrap();
        assert_eq!(header, CommandHeader::new(0x500, 0, 1, 0));
    }

    #[test]
    fn test_fields_are_masked() {
        let header = CommandHeader::new(0xFFFF, 0xFFFF, 0xFF, 0xFF);
        assert_eq!(header.to_u32(), 0xFF7F_F7FF);
        let decoded = CommandHeader::from_u32(header.to_u32());
        assert_eq!(decoded, CommandHeader::new(0x7FF, 0x7FF, 0xF, 0xF));
    }

    #[test]
    fn test_decode_too_short() {
        let err = CommandHeader::decode(&[1, 2], EndiannessActor::Firmware).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CODEC_BUFFER_TOO_SHORT);
    }
}
