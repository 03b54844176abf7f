// Licensed under the Apache-2.0 license

use crate::padding::padding_len;
use crate::read_u32_le;
use bkps_error::{raise_err, BkpsResult};

/// "_ENC" marker at the start of every SIGMA_ENC plaintext.
pub const PAYLOAD_MAGIC_NUMBER: u32 = 0x5F45_4E43;

const MAGIC_LEN: usize = 4;
const RESERVED_LEN: usize = 4;
const MSG_PACK_SIZE: usize = 32;

/// Plaintext framing of a SIGMA_ENC payload before encryption:
/// magic, reserved word, value and zero padding to a 32-byte boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    value: Vec<u8>,
    padding_len: usize,
}

impl EncryptedPayload {
    pub fn new(value: Vec<u8>) -> Self {
        let padding_len = padding_len(MAGIC_LEN + RESERVED_LEN + value.len(), MSG_PACK_SIZE);
        Self { value, padding_len }
    }

    pub fn padding_len(&self) -> u8 {
        self.padding_len as u8
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC_LEN + RESERVED_LEN + self.value.len() + self.padding_len);
        out.extend_from_slice(&PAYLOAD_MAGIC_NUMBER.to_le_bytes());
        out.extend_from_slice(&[0u8; RESERVED_LEN]);
        out.extend_from_slice(&self.value);
        out.resize(out.len() + self.padding_len, 0);
        out
    }
}

/// Decrypted SIGMA_ENC response payload with its framing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPayload {
    pub value: Vec<u8>,
}

impl DecryptedPayload {
    pub fn parse(decrypted: &[u8], padding_len: usize) -> BkpsResult<Self> {
        let minimum = MAGIC_LEN + RESERVED_LEN + padding_len;
        if decrypted.len() < minimum {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "EncryptedPayload should be at least {minimum} bytes len but is {} bytes len.",
                decrypted.len()
            );
        }
        let magic = read_u32_le(decrypted, 0).unwrap_or_default();
        if magic != PAYLOAD_MAGIC_NUMBER {
            raise_err!(
                CODEC_INVALID_MAGIC,
                "Invalid magic number in EncryptedPayload. Expected: 0x{PAYLOAD_MAGIC_NUMBER:08X}, Actual: 0x{magic:08X}."
            );
        }
        let value = decrypted[MAGIC_LEN + RESERVED_LEN..decrypted.len() - padding_len].to_vec();
        Ok(Self { value })
    }
}
