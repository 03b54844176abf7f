// Licensed under the Apache-2.0 license

use bkps_crypto::{kdf_hmac_sha384_counter, EcdhKeyPair, SHA384_LEN};
use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use zeroize::Zeroizing;

const KDF_CONTEXT: &[u8] = b"SIGMA";
/// AES-256 uses the first 32 bytes of the session encryption key.
pub const SEK_LEN: usize = 32;

/// Keys derived from the SIGMA Diffie-Hellman exchange.
pub struct SessionKeys {
    /// Protocol MAC key, authenticates M2 and M3.
    pub pmk: Zeroizing<Vec<u8>>,
    /// Session encryption key.
    pub sek: Zeroizing<Vec<u8>>,
    /// Session MAC key, authenticates SIGMA_ENC traffic.
    pub smk: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    pub fn derive(own: &EcdhKeyPair, peer_public_key: &[u8]) -> BkpsResult<Self> {
        Self::derive_inner(own, peer_public_key).map_err(|e| {
            BkpsError::new(
                ErrorKind::SIGMA_KEY_DERIVATION_FAILED,
                "Failed to derive SIGMA session keys.",
            )
            .with_source(e)
        })
    }

    fn derive_inner(own: &EcdhKeyPair, peer_public_key: &[u8]) -> BkpsResult<Self> {
        let shared = own.shared_secret(peer_public_key)?;
        let pmk = kdf_hmac_sha384_counter(&shared, b"PMK", KDF_CONTEXT, SHA384_LEN)?;
        let mut sek = kdf_hmac_sha384_counter(&shared, b"SEK", KDF_CONTEXT, SHA384_LEN)?;
        sek.truncate(SEK_LEN);
        let smk = kdf_hmac_sha384_counter(&shared, b"SMK", KDF_CONTEXT, SHA384_LEN)?;
        Ok(Self { pmk, sek, smk })
    }
}
