// Licensed under the Apache-2.0 license

use super::verify::{SigmaEncIntegrityVerifier, SigmaVerifier};
use bkps_api::sigma::{SigmaEncMessage, SIGMA_IV_LEN};
use bkps_api::{DecryptedPayload, EncryptedPayload};
use bkps_crypto::{aes256_ctr, hmac_sha384};
use bkps_error::{raise_err, BkpsResult};

/// Frames, encrypts and authenticates SIGMA_ENC payloads of one session.
/// The AES-CTR counter block is the session IV followed by the big-endian
/// message counter.
pub struct SigmaEncCodec<'a> {
    pub sdm_session_id: u32,
    pub sek: &'a [u8],
    pub smk: &'a [u8],
    pub initial_iv: &'a [u8],
}

impl SigmaEncCodec<'_> {
    fn iv(&self) -> BkpsResult<[u8; SIGMA_IV_LEN]> {
        match self.initial_iv.try_into() {
            Ok(iv) => Ok(iv),
            Err(_) => raise_err!(
                SIGMA_INVALID_FLOW_STAGE,
                "Session IV should be {SIGMA_IV_LEN} bytes but is {} bytes.",
                self.initial_iv.len()
            ),
        }
    }

    fn counter_block(iv: &[u8; SIGMA_IV_LEN], counter: u32) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[..SIGMA_IV_LEN].copy_from_slice(iv);
        block[SIGMA_IV_LEN..].copy_from_slice(&counter.to_be_bytes());
        block
    }

    /// Wraps `value` into a SIGMA_ENC message carrying `counter`.
    pub fn seal(&self, counter: u32, value: Vec<u8>) -> BkpsResult<SigmaEncMessage> {
        let iv = self.iv()?;
        let payload = EncryptedPayload::new(value);
        let ciphertext = aes256_ctr(self.sek, &Self::counter_block(&iv, counter), &payload.build())?;
        let mut message = SigmaEncMessage::new(
            self.sdm_session_id,
            counter,
            iv,
            payload.padding_len(),
            ciphertext,
        );
        message.mac = hmac_sha384(self.smk, &message.mac_data())?;
        Ok(message)
    }

    /// Authenticates `message` and returns its plaintext value. A message
    /// without payload yields an empty value. Counter ordering is checked
    /// by the caller.
    pub fn open(&self, message: &SigmaEncMessage) -> BkpsResult<Vec<u8>> {
        SigmaEncIntegrityVerifier {
            smk: self.smk,
            message,
        }
        .verify()?;
        if message.encrypted_payload.is_empty() {
            return Ok(Vec::new());
        }
        let block = Self::counter_block(&message.header.initial_iv, message.header.message_counter);
        let decrypted = aes256_ctr(self.sek, &block, &message.encrypted_payload)?;
        let payload =
            DecryptedPayload::parse(&decrypted, message.header.number_of_padding_bytes as usize)?;
        Ok(payload.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkps_error::ErrorKind;

    fn codec() -> SigmaEncCodec<'static> {
        SigmaEncCodec {
            sdm_session_id: 3,
            sek: &[0x11; 32],
            smk: &[0x22; 48],
            initial_iv: &[0x33; 12],
        }
    }

    #[test]
    fn test_seal_then_open() {
        let codec = codec();
        let message = codec.seal(7, b"certificate command".to_vec()).unwrap();
        assert_eq!(message.header.message_counter, 7);
        assert_eq!(message.encrypted_payload.len() % 32, 0);
        let reparsed = SigmaEncMessage::parse(&message.build()).unwrap();
        assert_eq!(codec.open(&reparsed).unwrap(), b"certificate command");
    }

    #[test]
    fn test_counter_changes_keystream() {
        let codec = codec();
        let a = codec.seal(1, vec![0; 8]).unwrap();
        let b = codec.seal(2, vec![0; 8]).unwrap();
        assert_ne!(a.encrypted_payload, b.encrypted_payload);
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let codec = codec();
        let mut message = codec.seal(1, vec![5; 8]).unwrap();
        message.encrypted_payload[0] ^= 1;
        assert_eq!(
            codec.open(&message).unwrap_err().kind(),
            ErrorKind::SIGMA_INTEGRITY_VERIFICATION_FAILED
        );
    }

    #[test]
    fn test_header_only_message() {
        let codec = codec();
        let mut message = SigmaEncMessage::new(3, 2, [0x33; 12], 0, Vec::new());
        message.mac = hmac_sha384(codec.smk, &message.mac_data()).unwrap();
        assert!(codec.open(&message).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_session_iv() {
        let codec = SigmaEncCodec {
            initial_iv: &[0; 4],
            ..codec()
        };
        assert!(codec.seal(1, vec![]).is_err());
    }
}
