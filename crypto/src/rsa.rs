// Licensed under the Apache-2.0 license

use crate::OsslResultExt;
use bkps_error::{BkpsResult, ErrorKind};
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPrivate, HasPublic, PKey, PKeyRef};
use openssl::rsa::Padding;
use zeroize::Zeroizing;

/// RSA-OAEP (SHA-256, MGF1-SHA-256) encryption under a DER SubjectPublicKeyInfo.
pub fn rsa_oaep_encrypt(public_key_der: &[u8], data: &[u8]) -> BkpsResult<Vec<u8>> {
    let key = PKey::public_key_from_der(public_key_der)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid RSA public key.")?;
    oaep_encrypt(&key, data)
}

pub(crate) fn oaep_encrypt<T: HasPublic>(key: &PKeyRef<T>, data: &[u8]) -> BkpsResult<Vec<u8>> {
    let mut encrypter = Encrypter::new(key).or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA init failed.")?;
    encrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .and_then(|_| encrypter.set_rsa_oaep_md(MessageDigest::sha256()))
        .and_then(|_| encrypter.set_rsa_mgf1_md(MessageDigest::sha256()))
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP setup failed.")?;
    let len = encrypter
        .encrypt_len(data)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP encryption failed.")?;
    let mut out = vec![0u8; len];
    let written = encrypter
        .encrypt(data, &mut out)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP encryption failed.")?;
    out.truncate(written);
    Ok(out)
}

pub(crate) fn oaep_decrypt<T: HasPrivate>(
    key: &PKeyRef<T>,
    data: &[u8],
) -> BkpsResult<Zeroizing<Vec<u8>>> {
    let mut decrypter = Decrypter::new(key).or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA init failed.")?;
    decrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .and_then(|_| decrypter.set_rsa_oaep_md(MessageDigest::sha256()))
        .and_then(|_| decrypter.set_rsa_mgf1_md(MessageDigest::sha256()))
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP setup failed.")?;
    let len = decrypter
        .decrypt_len(data)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP decryption failed.")?;
    let mut out = Zeroizing::new(vec![0u8; len]);
    let written = decrypter
        .decrypt(data, &mut out)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "RSA-OAEP decryption failed.")?;
    out.truncate(written);
    Ok(out)
}
