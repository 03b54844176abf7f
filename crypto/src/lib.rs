/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the cryptographic primitives and the security enclave
    abstraction used by the provisioning service.

--*/

mod aes;
mod digest;
mod ecc;
mod enclave;
mod kdf;
mod provider;
mod rsa;

pub use aes::{
    aes256_ctr, aes256_gcm_decrypt, aes256_gcm_encrypt, aes256_gcm_open, aes256_gcm_seal,
    AES_GCM_IV_LEN, AES_GCM_TAG_LEN,
};
pub use digest::{hmac_sha384, hmac_sha384_verify, sha256, sha384, SHA256_LEN, SHA384_LEN};
pub use ecc::{
    ecdsa_der_to_raw, ecdsa_raw_to_der, ecdsa_sign_raw, ecdsa_verify_raw, public_key_from_raw,
    public_key_to_raw, EcdhKeyPair, ECC384_PUB_KEY_LEN, ECC384_SCALAR_LEN, ECC384_SIGNATURE_LEN,
};
pub use enclave::{OpensslEnclave, SecurityEnclave, SecurityObjectType};
pub use kdf::kdf_hmac_sha384_counter;
pub use provider::{AesGcmProvider, EncryptionProvider};
pub use rsa::rsa_oaep_encrypt;

use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use openssl::error::ErrorStack;

/// Random enclave alias in the 8-4-4-4-12 hex layout.
pub fn random_guid() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

pub(crate) trait OsslResultExt<T> {
    fn or_crypto(self, kind: ErrorKind, msg: &str) -> BkpsResult<T>;
}

impl<T> OsslResultExt<T> for Result<T, ErrorStack> {
    fn or_crypto(self, kind: ErrorKind, msg: &str) -> BkpsResult<T> {
        self.map_err(|e| BkpsError::new(kind, msg).with_source(e))
    }
}
