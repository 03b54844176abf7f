// Licensed under the Apache-2.0 license

use crate::aes::{aes256_gcm_decrypt, aes256_gcm_encrypt};
use crate::rsa::{oaep_decrypt, oaep_encrypt};
use crate::OsslResultExt;
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rand::rand_bytes;
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use zeroize::Zeroizing;

const AES_KEY_LEN: usize = 32;
const RSA_KEY_BITS: u32 = 3072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityObjectType {
    /// AES-256 key for GCM encryption at rest.
    Aes256,
    /// P-384 key for ECDSA-SHA384 signing.
    Ec384,
    /// RSA key for OAEP import of wrapped keys.
    Rsa,
}

/// Key store that never hands out private or secret key material. Objects
/// are addressed by alias, usually a random GUID.
pub trait SecurityEnclave: Send + Sync {
    fn create_object(&self, alias: &str, object_type: SecurityObjectType) -> BkpsResult<()>;

    /// Creates an AES key under `alias` and returns a copy of it encrypted
    /// with RSA-OAEP under `rsa_public_key_der`.
    fn create_exportable(&self, alias: &str, rsa_public_key_der: &[u8]) -> BkpsResult<Vec<u8>>;

    fn exists(&self, alias: &str) -> bool;

    fn delete(&self, alias: &str) -> BkpsResult<()>;

    /// DER SubjectPublicKeyInfo of an asymmetric object.
    fn public_key(&self, alias: &str) -> BkpsResult<Vec<u8>>;

    /// DER ECDSA-SHA384 signature.
    fn sign(&self, alias: &str, data: &[u8]) -> BkpsResult<Vec<u8>>;

    fn decrypt_rsa(&self, alias: &str, data: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>>;

    fn import_aes(&self, alias: &str, key: &[u8]) -> BkpsResult<()>;

    fn encrypt_aes(&self, alias: &str, plaintext: &[u8]) -> BkpsResult<Vec<u8>>;

    fn decrypt_aes(&self, alias: &str, ciphertext: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>>;
}

enum SecurityObject {
    Aes(Zeroizing<Vec<u8>>),
    Ec(PKey<Private>),
    Rsa(PKey<Private>),
}

/// In-process enclave backed by openssl.
#[derive(Default)]
pub struct OpensslEnclave {
    objects: Mutex<HashMap<String, SecurityObject>>,
}

impl OpensslEnclave {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> BkpsResult<MutexGuard<'_, HashMap<String, SecurityObject>>> {
        self.objects
            .lock()
            .map_err(|_| BkpsError::new(ErrorKind::ENCLAVE_FAILURE, "Enclave store is poisoned."))
    }

    fn insert(&self, alias: &str, object: SecurityObject) -> BkpsResult<()> {
        let mut objects = self.objects()?;
        if objects.contains_key(alias) {
            raise_err!(ENCLAVE_FAILURE, "Security object {alias} already exists.");
        }
        objects.insert(alias.to_string(), object);
        Ok(())
    }

    fn with_object<R>(
        &self,
        alias: &str,
        f: impl FnOnce(&SecurityObject) -> BkpsResult<R>,
    ) -> BkpsResult<R> {
        let objects = self.objects()?;
        match objects.get(alias) {
            Some(object) => f(object),
            None => raise_err!(
                ENCLAVE_OBJECT_NOT_FOUND,
                "Security object {alias} does not exist."
            ),
        }
    }

    fn random_aes_key() -> BkpsResult<Zeroizing<Vec<u8>>> {
        let mut key = Zeroizing::new(vec![0u8; AES_KEY_LEN]);
        rand_bytes(&mut key).or_crypto(ErrorKind::ENCLAVE_FAILURE, "AES key generation failed.")?;
        Ok(key)
    }
}

fn wrong_type(alias: &str, expected: &str) -> BkpsError {
    BkpsError::new(
        ErrorKind::ENCLAVE_FAILURE,
        format!("Security object {alias} is not an {expected} key."),
    )
}

impl SecurityEnclave for OpensslEnclave {
    fn create_object(&self, alias: &str, object_type: SecurityObjectType) -> BkpsResult<()> {
        let object = match object_type {
            SecurityObjectType::Aes256 => SecurityObject::Aes(Self::random_aes_key()?),
            SecurityObjectType::Ec384 => {
                let group = EcGroup::from_curve_name(Nid::SECP384R1)
                    .or_crypto(ErrorKind::ENCLAVE_FAILURE, "P-384 unavailable.")?;
                let key = EcKey::generate(&group)
                    .and_then(PKey::from_ec_key)
                    .or_crypto(ErrorKind::ENCLAVE_FAILURE, "EC key generation failed.")?;
                SecurityObject::Ec(key)
            }
            SecurityObjectType::Rsa => {
                let key = Rsa::generate(RSA_KEY_BITS)
                    .and_then(PKey::from_rsa)
                    .or_crypto(ErrorKind::ENCLAVE_FAILURE, "RSA key generation failed.")?;
                SecurityObject::Rsa(key)
            }
        };
        log::debug!("Creating security object {alias} of type {object_type:?}.");
        self.insert(alias, object)
    }

    fn create_exportable(&self, alias: &str, rsa_public_key_der: &[u8]) -> BkpsResult<Vec<u8>> {
        let import_key = PKey::public_key_from_der(rsa_public_key_der)
            .or_crypto(ErrorKind::ENCLAVE_FAILURE, "Invalid RSA import public key.")?;
        let key = Self::random_aes_key()?;
        let wrapped = oaep_encrypt(&import_key, &key)?;
        self.insert(alias, SecurityObject::Aes(key))?;
        Ok(wrapped)
    }

    fn exists(&self, alias: &str) -> bool {
        self.objects()
            .map(|objects| objects.contains_key(alias))
            .unwrap_or(false)
    }

    fn delete(&self, alias: &str) -> BkpsResult<()> {
        match self.objects()?.remove(alias) {
            Some(_) => Ok(()),
            None => raise_err!(
                ENCLAVE_OBJECT_NOT_FOUND,
                "Security object {alias} does not exist."
            ),
        }
    }

    fn public_key(&self, alias: &str) -> BkpsResult<Vec<u8>> {
        self.with_object(alias, |object| match object {
            SecurityObject::Ec(key) | SecurityObject::Rsa(key) => key
                .public_key_to_der()
                .or_crypto(ErrorKind::ENCLAVE_FAILURE, "Public key export failed."),
            SecurityObject::Aes(_) => Err(wrong_type(alias, "asymmetric")),
        })
    }

    fn sign(&self, alias: &str, data: &[u8]) -> BkpsResult<Vec<u8>> {
        self.with_object(alias, |object| {
            let SecurityObject::Ec(key) = object else {
                return Err(wrong_type(alias, "EC"));
            };
            let mut signer = Signer::new(MessageDigest::sha384(), key)
                .or_crypto(ErrorKind::ENCLAVE_FAILURE, "Signer init failed.")?;
            signer
                .update(data)
                .and_then(|_| signer.sign_to_vec())
                .or_crypto(ErrorKind::ENCLAVE_FAILURE, "Signing failed.")
        })
    }

    fn decrypt_rsa(&self, alias: &str, data: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
        self.with_object(alias, |object| match object {
            SecurityObject::Rsa(key) => oaep_decrypt(key, data),
            _ => Err(wrong_type(alias, "RSA")),
        })
    }

    fn import_aes(&self, alias: &str, key: &[u8]) -> BkpsResult<()> {
        if key.len() != AES_KEY_LEN {
            raise_err!(
                ENCLAVE_FAILURE,
                "Imported AES key must be {AES_KEY_LEN} bytes but is {} bytes.",
                key.len()
            );
        }
        self.insert(alias, SecurityObject::Aes(Zeroizing::new(key.to_vec())))
    }

    fn encrypt_aes(&self, alias: &str, plaintext: &[u8]) -> BkpsResult<Vec<u8>> {
        self.with_object(alias, |object| match object {
            SecurityObject::Aes(key) => aes256_gcm_encrypt(key, plaintext),
            _ => Err(wrong_type(alias, "AES")),
        })
    }

    fn decrypt_aes(&self, alias: &str, ciphertext: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
        self.with_object(alias, |object| match object {
            SecurityObject::Aes(key) => aes256_gcm_decrypt(key, ciphertext),
            _ => Err(wrong_type(alias, "AES")),
        })
    }
}
