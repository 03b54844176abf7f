// Licensed under the Apache-2.0 license

use bkps_api::spdm::{length_u16, SpdmSecuredMessage};
use bkps_crypto::{
    aes256_gcm_open, aes256_gcm_seal, hmac_sha384, kdf_hmac_sha384_counter, sha384, AES_GCM_IV_LEN,
    SHA384_LEN,
};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use zeroize::Zeroizing;

const AEAD_KEY_LEN: usize = 32;

/// Secrets of a KEY_EXCHANGE handshake. The transcript hash binds them to
/// the negotiated messages and the responder certificate chain.
pub struct SpdmHandshake {
    handshake_secret: Zeroizing<Vec<u8>>,
    request_finished_key: Zeroizing<Vec<u8>>,
    response_finished_key: Zeroizing<Vec<u8>>,
}

impl SpdmHandshake {
    /// `th1` is the transcript hash through the KEY_EXCHANGE_RSP signature.
    pub fn derive(shared_secret: &[u8], th1: &[u8]) -> BkpsResult<Self> {
        let handshake_secret = Zeroizing::new(hmac_sha384(&[0u8; SHA384_LEN], shared_secret)?.to_vec());
        let request = kdf_hmac_sha384_counter(&handshake_secret, b"req hs data", th1, SHA384_LEN)?;
        let response = kdf_hmac_sha384_counter(&handshake_secret, b"rsp hs data", th1, SHA384_LEN)?;
        Ok(Self {
            request_finished_key: kdf_hmac_sha384_counter(&request, b"finished", &[], SHA384_LEN)?,
            response_finished_key: kdf_hmac_sha384_counter(&response, b"finished", &[], SHA384_LEN)?,
            handshake_secret,
        })
    }

    pub fn responder_verify_data(&self, th1: &[u8]) -> BkpsResult<[u8; SHA384_LEN]> {
        hmac_sha384(&self.response_finished_key, th1)
    }

    pub fn requester_verify_data(&self, transcript: &[u8]) -> BkpsResult<[u8; SHA384_LEN]> {
        hmac_sha384(&self.request_finished_key, &sha384(transcript))
    }

    /// Application data keys, derived once FINISH_RSP closed the handshake.
    pub fn data_keys(&self, th2: &[u8]) -> BkpsResult<(DirectionKeys, DirectionKeys)> {
        let master_secret = kdf_hmac_sha384_counter(&self.handshake_secret, b"derived", &[], SHA384_LEN)?;
        let direction = |key_label: &[u8], iv_label: &[u8]| -> BkpsResult<DirectionKeys> {
            let key = kdf_hmac_sha384_counter(&master_secret, key_label, th2, AEAD_KEY_LEN)?;
            let iv = kdf_hmac_sha384_counter(&master_secret, iv_label, th2, AES_GCM_IV_LEN)?;
            let mut salt = [0u8; AES_GCM_IV_LEN];
            salt.copy_from_slice(&iv);
            Ok(DirectionKeys {
                key,
                salt,
                sequence_number: 0,
            })
        };
        Ok((
            direction(b"req data key", b"req data iv")?,
            direction(b"rsp data key", b"rsp data iv")?,
        ))
    }
}

/// AEAD key of one direction. The record IV is the salt with the
/// little-endian sequence number XORed into its leading bytes.
pub struct DirectionKeys {
    key: Zeroizing<Vec<u8>>,
    salt: [u8; AES_GCM_IV_LEN],
    sequence_number: u64,
}

impl DirectionKeys {
    fn next_iv(&mut self) -> BkpsResult<[u8; AES_GCM_IV_LEN]> {
        let mut iv = self.salt;
        for (byte, seq) in iv.iter_mut().zip(self.sequence_number.to_le_bytes()) {
            *byte ^= seq;
        }
        self.sequence_number = match self.sequence_number.checked_add(1) {
            Some(next) => next,
            None => raise_err!(CRYPTO_FAILURE, "SPDM session sequence number exhausted."),
        };
        Ok(iv)
    }
}

/// Established session. Records carry `app length (2) | app data` where
/// the app data starts with the MCTP message type.
pub struct SpdmSession {
    pub session_id: u32,
    outbound: DirectionKeys,
    inbound: DirectionKeys,
}

impl SpdmSession {
    pub fn session_id(req_session_id: u16, rsp_session_id: u16) -> u32 {
        u32::from(req_session_id) | u32::from(rsp_session_id) << 16
    }

    pub fn requester(session_id: u32, handshake: &SpdmHandshake, th2: &[u8]) -> BkpsResult<Self> {
        let (request, response) = handshake.data_keys(th2)?;
        Ok(Self {
            session_id,
            outbound: request,
            inbound: response,
        })
    }

    pub fn responder(session_id: u32, handshake: &SpdmHandshake, th2: &[u8]) -> BkpsResult<Self> {
        let (request, response) = handshake.data_keys(th2)?;
        Ok(Self {
            session_id,
            outbound: response,
            inbound: request,
        })
    }

    pub fn seal(&mut self, app_data: &[u8]) -> BkpsResult<Vec<u8>> {
        let mut plaintext = Zeroizing::new(Vec::with_capacity(2 + app_data.len()));
        plaintext.extend_from_slice(&length_u16(app_data.len(), "Application data")?);
        plaintext.extend_from_slice(app_data);
        let sealed_len = plaintext.len() + bkps_crypto::AES_GCM_TAG_LEN;
        let aad = SpdmSecuredMessage::aad(self.session_id, sealed_len)?;
        let iv = self.outbound.next_iv()?;
        let sealed = aes256_gcm_seal(&self.outbound.key, &iv, &aad, &plaintext)?;
        Ok(SpdmSecuredMessage {
            session_id: self.session_id,
            sealed,
        }
        .build()?)
    }

    pub fn open(&mut self, record: &[u8]) -> BkpsResult<Vec<u8>> {
        let message = SpdmSecuredMessage::parse(record)?;
        if message.session_id != self.session_id {
            raise_err!(
                SPDM_COMMAND_FAILED,
                "Secured message belongs to session 0x{:08x}, expected 0x{:08x}.",
                message.session_id,
                self.session_id
            );
        }
        let aad = SpdmSecuredMessage::aad(message.session_id, message.sealed.len())?;
        let iv = self.inbound.next_iv()?;
        let plaintext = aes256_gcm_open(&self.inbound.key, &iv, &aad, &message.sealed).map_err(|e| {
            BkpsError::new(ErrorKind::SPDM_COMMAND_FAILED, "Failed to decrypt secured SPDM message.")
                .with_source(e)
        })?;
        let Some(len) = plaintext.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]) as usize) else {
            raise_err!(CODEC_BUFFER_TOO_SHORT, "Secured SPDM message has no application data length.");
        };
        match plaintext.get(2..2 + len) {
            Some(app_data) => Ok(app_data.to_vec()),
            None => raise_err!(
                CODEC_INVALID_LENGTH,
                "Secured SPDM message declares {len} bytes of application data but carries {}.",
                plaintext.len() - 2
            ),
        }
    }
}
