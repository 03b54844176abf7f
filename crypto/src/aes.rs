// Licensed under the Apache-2.0 license

use crate::OsslResultExt;
use bkps_error::{raise_err, BkpsResult, ErrorKind};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt, encrypt_aead, Cipher};
use zeroize::Zeroizing;

pub const AES_GCM_IV_LEN: usize = 12;
pub const AES_GCM_TAG_LEN: usize = 16;
const AES_CTR_IV_LEN: usize = 16;

/// AES-256-CTR. Encryption and decryption are the same operation.
pub fn aes256_ctr(key: &[u8], iv: &[u8; AES_CTR_IV_LEN], data: &[u8]) -> BkpsResult<Vec<u8>> {
    encrypt(Cipher::aes_256_ctr(), key, Some(iv), data)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "AES-CTR operation failed.")
}

/// AES-256-GCM with a random IV. Output is `iv || ciphertext || tag`.
pub fn aes256_gcm_encrypt(key: &[u8], plaintext: &[u8]) -> BkpsResult<Vec<u8>> {
    let mut iv = [0u8; AES_GCM_IV_LEN];
    rand_bytes(&mut iv).or_crypto(ErrorKind::CRYPTO_FAILURE, "IV generation failed.")?;
    let mut tag = [0u8; AES_GCM_TAG_LEN];
    let ciphertext = encrypt_aead(Cipher::aes_256_gcm(), key, Some(&iv), &[], plaintext, &mut tag)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "AES-GCM encryption failed.")?;
    let mut out = Vec::with_capacity(AES_GCM_IV_LEN + ciphertext.len() + AES_GCM_TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Reverses [`aes256_gcm_encrypt`]. Fails on a wrong key or any modification.
pub fn aes256_gcm_decrypt(key: &[u8], blob: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
    if blob.len() < AES_GCM_IV_LEN + AES_GCM_TAG_LEN {
        raise_err!(CRYPTO_FAILURE, "AES-GCM ciphertext is too short.");
    }
    let (iv, rest) = blob.split_at(AES_GCM_IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - AES_GCM_TAG_LEN);
    let plaintext = decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), &[], ciphertext, tag)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "AES-GCM decryption failed.")?;
    Ok(Zeroizing::new(plaintext))
}

/// AES-256-GCM with caller supplied IV and associated data. Output is
/// `ciphertext || tag`.
pub fn aes256_gcm_seal(key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> BkpsResult<Vec<u8>> {
    let mut tag = [0u8; AES_GCM_TAG_LEN];
    let mut out = encrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), aad, plaintext, &mut tag)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "AES-GCM encryption failed.")?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Reverses [`aes256_gcm_seal`].
pub fn aes256_gcm_open(key: &[u8], iv: &[u8], aad: &[u8], sealed: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < AES_GCM_TAG_LEN {
        raise_err!(CRYPTO_FAILURE, "AES-GCM ciphertext is too short.");
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - AES_GCM_TAG_LEN);
    let plaintext = decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), aad, ciphertext, tag)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "AES-GCM decryption failed.")?;
    Ok(Zeroizing::new(plaintext))
}
