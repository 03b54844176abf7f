// Licensed under the Apache-2.0 license

use crate::enclave::SecurityEnclave;
use bkps_error::BkpsResult;
use std::sync::Arc;
use zeroize::Zeroizing;

pub trait EncryptionProvider {
    fn encrypt(&self, plaintext: &[u8]) -> BkpsResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>>;
}

/// AES-256-GCM under an enclave key. Blobs are `iv(12) || ciphertext || tag(16)`.
#[derive(Clone)]
pub struct AesGcmProvider {
    enclave: Arc<dyn SecurityEnclave>,
    alias: String,
}

impl AesGcmProvider {
    pub fn new(enclave: Arc<dyn SecurityEnclave>, alias: impl Into<String>) -> Self {
        Self {
            enclave,
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl EncryptionProvider for AesGcmProvider {
    fn encrypt(&self, plaintext: &[u8]) -> BkpsResult<Vec<u8>> {
        self.enclave.encrypt_aes(&self.alias, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
        self.enclave.decrypt_aes(&self.alias, ciphertext)
    }
}
