// Licensed under the Apache-2.0 license

use crate::OsslResultExt;
use bkps_error::{BkpsResult, ErrorKind};
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::sha::{Sha256, Sha384};
use openssl::sign::Signer;

pub const SHA256_LEN: usize = 32;
pub const SHA384_LEN: usize = 48;

pub fn sha256(data: &[u8]) -> [u8; SHA256_LEN] {
    let mut engine = Sha256::new();
    engine.update(data);
    engine.finish()
}

pub fn sha384(data: &[u8]) -> [u8; SHA384_LEN] {
    let mut engine = Sha384::new();
    engine.update(data);
    engine.finish()
}

pub fn hmac_sha384(key: &[u8], data: &[u8]) -> BkpsResult<[u8; SHA384_LEN]> {
    let mut tag = [0u8; SHA384_LEN];
    let pkey = PKey::hmac(key).or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid HMAC key.")?;
    let mut signer = Signer::new(MessageDigest::sha384(), &pkey)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "HMAC init failed.")?;
    signer
        .update(data)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "HMAC update failed.")?;
    signer
        .sign(&mut tag)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "HMAC finish failed.")?;
    Ok(tag)
}

/// Constant time comparison of `expected` with the HMAC of `data`.
pub fn hmac_sha384_verify(key: &[u8], data: &[u8], expected: &[u8]) -> BkpsResult<bool> {
    let tag = hmac_sha384(key, data)?;
    Ok(expected.len() == tag.len() && memcmp::eq(&tag, expected))
}
