// Licensed under the Apache-2.0 license

use crate::digest::sha384;
use crate::OsslResultExt;
use bkps_error::{raise_err, BkpsResult, ErrorKind};
use openssl::bn::{BigNum, BigNumContext};
use openssl::derive::Deriver;
use openssl::ec::{EcGroup, EcKey, EcKeyRef, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use zeroize::Zeroizing;

pub const ECC384_SCALAR_LEN: usize = 48;
/// Raw public key: `x || y`.
pub const ECC384_PUB_KEY_LEN: usize = 2 * ECC384_SCALAR_LEN;
/// Raw signature: `r || s`.
pub const ECC384_SIGNATURE_LEN: usize = 2 * ECC384_SCALAR_LEN;

fn p384() -> BkpsResult<EcGroup> {
    EcGroup::from_curve_name(Nid::SECP384R1).or_crypto(ErrorKind::CRYPTO_FAILURE, "P-384 unavailable.")
}

fn bn_ctx() -> BkpsResult<BigNumContext> {
    BigNumContext::new().or_crypto(ErrorKind::CRYPTO_FAILURE, "BigNum context allocation failed.")
}

fn bn(bytes: &[u8]) -> BkpsResult<BigNum> {
    BigNum::from_slice(bytes).or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid big number.")
}

fn padded(num: &openssl::bn::BigNumRef) -> BkpsResult<Vec<u8>> {
    num.to_vec_padded(ECC384_SCALAR_LEN as i32)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Scalar exceeds 48 bytes.")
}

/// Ephemeral P-384 key pair used for the SIGMA Diffie-Hellman exchange.
#[derive(Clone)]
pub struct EcdhKeyPair {
    key: EcKey<Private>,
}

impl EcdhKeyPair {
    pub fn generate() -> BkpsResult<Self> {
        let group = p384()?;
        let key = EcKey::generate(&group).or_crypto(ErrorKind::CRYPTO_FAILURE, "EC key generation failed.")?;
        Ok(Self { key })
    }

    /// Rebuilds the key pair from the private scalar kept in the context.
    pub fn from_private_bytes(bytes: &[u8]) -> BkpsResult<Self> {
        let group = p384()?;
        let ctx = bn_ctx()?;
        let private = bn(bytes)?;
        let mut public = EcPoint::new(&group).or_crypto(ErrorKind::CRYPTO_FAILURE, "EC point allocation failed.")?;
        public
            .mul_generator(&group, &private, &ctx)
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "Public point derivation failed.")?;
        let key = EcKey::from_private_components(&group, &private, &public)
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid EC private key.")?;
        key.check_key()
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid EC private key.")?;
        Ok(Self { key })
    }

    pub fn private_bytes(&self) -> BkpsResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(padded(self.key.private_key())?))
    }

    pub fn public_key_raw(&self) -> BkpsResult<[u8; ECC384_PUB_KEY_LEN]> {
        public_key_to_raw(&self.key)
    }

    pub fn ec_key(&self) -> &EcKeyRef<Private> {
        &self.key
    }

    /// ECDH shared secret with a peer raw public key.
    pub fn shared_secret(&self, peer_raw: &[u8]) -> BkpsResult<Zeroizing<Vec<u8>>> {
        let peer = PKey::from_ec_key(public_key_from_raw(peer_raw)?)
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid peer key.")?;
        let own = PKey::from_ec_key(self.key.clone())
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid own key.")?;
        let mut deriver = Deriver::new(&own).or_crypto(ErrorKind::CRYPTO_FAILURE, "ECDH init failed.")?;
        deriver
            .set_peer(&peer)
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "ECDH peer rejected.")?;
        let secret = deriver
            .derive_to_vec()
            .or_crypto(ErrorKind::CRYPTO_FAILURE, "ECDH derivation failed.")?;
        Ok(Zeroizing::new(secret))
    }
}

pub fn public_key_to_raw<T: HasPublic>(key: &EcKeyRef<T>) -> BkpsResult<[u8; ECC384_PUB_KEY_LEN]> {
    let mut ctx = bn_ctx()?;
    let mut x = BigNum::new().or_crypto(ErrorKind::CRYPTO_FAILURE, "BigNum allocation failed.")?;
    let mut y = BigNum::new().or_crypto(ErrorKind::CRYPTO_FAILURE, "BigNum allocation failed.")?;
    key.public_key()
        .affine_coordinates_gfp(key.group(), &mut x, &mut y, &mut ctx)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Public key coordinates unavailable.")?;
    let mut raw = [0u8; ECC384_PUB_KEY_LEN];
    raw[..ECC384_SCALAR_LEN].copy_from_slice(&padded(&x)?);
    raw[ECC384_SCALAR_LEN..].copy_from_slice(&padded(&y)?);
    Ok(raw)
}

pub fn public_key_from_raw(raw: &[u8]) -> BkpsResult<EcKey<Public>> {
    if raw.len() != ECC384_PUB_KEY_LEN {
        raise_err!(
            CRYPTO_FAILURE,
            "Raw P-384 public key must be {ECC384_PUB_KEY_LEN} bytes but is {} bytes.",
            raw.len()
        );
    }
    let group = p384()?;
    let x = bn(&raw[..ECC384_SCALAR_LEN])?;
    let y = bn(&raw[ECC384_SCALAR_LEN..])?;
    let key = EcKey::from_public_key_affine_coordinates(&group, &x, &y)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Point is not on curve P-384.")?;
    Ok(key)
}

fn sig_to_raw(sig: &EcdsaSig) -> BkpsResult<[u8; ECC384_SIGNATURE_LEN]> {
    let mut raw = [0u8; ECC384_SIGNATURE_LEN];
    raw[..ECC384_SCALAR_LEN].copy_from_slice(&padded(sig.r())?);
    raw[ECC384_SCALAR_LEN..].copy_from_slice(&padded(sig.s())?);
    Ok(raw)
}

fn raw_to_sig(raw: &[u8]) -> BkpsResult<EcdsaSig> {
    if raw.len() != ECC384_SIGNATURE_LEN {
        raise_err!(
            CRYPTO_FAILURE,
            "Raw P-384 signature must be {ECC384_SIGNATURE_LEN} bytes but is {} bytes.",
            raw.len()
        );
    }
    let r = bn(&raw[..ECC384_SCALAR_LEN])?;
    let s = bn(&raw[ECC384_SCALAR_LEN..])?;
    EcdsaSig::from_private_components(r, s).or_crypto(ErrorKind::CRYPTO_FAILURE, "Invalid signature.")
}

pub fn ecdsa_der_to_raw(der: &[u8]) -> BkpsResult<[u8; ECC384_SIGNATURE_LEN]> {
    let sig = EcdsaSig::from_der(der).or_crypto(ErrorKind::CRYPTO_FAILURE, "Malformed DER signature.")?;
    sig_to_raw(&sig)
}

pub fn ecdsa_raw_to_der(raw: &[u8]) -> BkpsResult<Vec<u8>> {
    raw_to_sig(raw)?
        .to_der()
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Signature DER encoding failed.")
}

/// ECDSA-SHA384 signature of `data` in `r || s` form.
pub fn ecdsa_sign_raw(key: &EcKeyRef<Private>, data: &[u8]) -> BkpsResult<[u8; ECC384_SIGNATURE_LEN]> {
    let sig = EcdsaSig::sign(&sha384(data), key).or_crypto(ErrorKind::CRYPTO_FAILURE, "ECDSA signing failed.")?;
    sig_to_raw(&sig)
}

/// Verifies an `r || s` ECDSA-SHA384 signature.
///
/// Returns `Ok(false)` for a well-formed signature that does not match and
/// an error when the key is not a P-384 key or the signature is malformed.
pub fn ecdsa_verify_raw<T: HasPublic>(
    key: &PKeyRef<T>,
    data: &[u8],
    signature: &[u8],
) -> BkpsResult<bool> {
    let ec = key
        .ec_key()
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "Public key is not an EC key.")?;
    if ec.group().curve_name() != Some(Nid::SECP384R1) {
        raise_err!(CRYPTO_FAILURE, "Public key is not on curve P-384.");
    }
    let sig = raw_to_sig(signature)?;
    sig.verify(&sha384(data), &ec)
        .or_crypto(ErrorKind::CRYPTO_FAILURE, "ECDSA verification failed.")
}
