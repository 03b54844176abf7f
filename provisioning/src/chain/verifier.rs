// Licensed under the Apache-2.0 license

use super::crl::{CrlProvider, PrePopulatedCrlProvider};
use super::fetch::IidFlowDetector;
use super::x509;
use bkps_crypto::sha256;
use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use openssl::asn1::Asn1Time;
use openssl::x509::{CrlStatus, X509Crl, X509};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Extended key usage of certificates whose key may run the BKP flow.
pub const KEY_PURPOSE_BKP: &str = "2.16.840.1.113741.1.15.4.2.1";
/// TCG DICE attestation initialization key purpose.
pub const KEY_PURPOSE_ATTEST_INIT: &str = "2.23.133.5.4.100.8";

/// What differs between device families when verifying a chain.
pub trait ChainVerificationPolicy {
    /// At least one must appear in the leaf extended key usage. Empty
    /// disables the check.
    fn expected_leaf_key_purposes(&self) -> &[&'static str];

    fn on_verification_failure(&self, details: &str) -> BkpsError;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiceBkpPolicy {
    pub test_mode_secrets: bool,
}

impl ChainVerificationPolicy for DiceBkpPolicy {
    fn expected_leaf_key_purposes(&self) -> &[&'static str] {
        &[KEY_PURPOSE_BKP, KEY_PURPOSE_ATTEST_INIT]
    }

    fn on_verification_failure(&self, details: &str) -> BkpsError {
        BkpsError::new(
            ErrorKind::DEVICE_CHAIN_VERIFICATION_FAILED,
            format!("Device DICE chain verification failed: {details}"),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct S10BkpPolicy;

impl ChainVerificationPolicy for S10BkpPolicy {
    fn expected_leaf_key_purposes(&self) -> &[&'static str] {
        &[]
    }

    fn on_verification_failure(&self, details: &str) -> BkpsError {
        BkpsError::new(
            ErrorKind::DEVICE_CHAIN_VERIFICATION_FAILED,
            format!("Device S10 chain verification failed: {details}"),
        )
    }
}

pub struct RootHashVerifier;

impl RootHashVerifier {
    /// True if the SHA-256 fingerprint of `root` is one of the trusted
    /// hashes. An empty list trusts any root.
    pub fn verify_root_hash(root: &[u8], trusted_root_hash: &[String]) -> bool {
        if trusted_root_hash.iter().all(|hash| hash.trim().is_empty()) {
            log::warn!("Skipping root hash verification - trusted root hash was not provided.");
            return true;
        }
        let root_hash = hex::encode(sha256(root));
        let trusted = trusted_root_hash
            .iter()
            .any(|hash| hash.trim().eq_ignore_ascii_case(&root_hash));
        if !trusted {
            log::debug!(
                "Root fingerprints do not match. Expected one of: {}, actual: {}",
                trusted_root_hash.join(", ").to_uppercase(),
                root_hash.to_uppercase()
            );
        }
        trusted
    }
}

fn now_within(cert: &X509) -> BkpsResult<bool> {
    let now = Asn1Time::days_from_now(0)
        .map_err(|e| BkpsError::new(ErrorKind::CRYPTO_FAILURE, "Failed to read time.").with_source(e))?;
    let after_start = now.compare(cert.not_before()).map(|o| o != Ordering::Less);
    let before_end = now.compare(cert.not_after()).map(|o| o != Ordering::Greater);
    match (after_start, before_end) {
        (Ok(a), Ok(b)) => Ok(a && b),
        _ => Ok(false),
    }
}

/// Verifies a certificate chain ordered leaf first.
pub struct ChainVerifier<'a, P: ChainVerificationPolicy> {
    policy: P,
    crl_provider: &'a dyn CrlProvider,
    trusted_root_hash: &'a [String],
    device_id: Option<String>,
}

impl<'a, P: ChainVerificationPolicy> ChainVerifier<'a, P> {
    pub fn new(policy: P, crl_provider: &'a dyn CrlProvider, trusted_root_hash: &'a [String]) -> Self {
        Self {
            policy,
            crl_provider,
            trusted_root_hash,
            device_id: None,
        }
    }

    /// Requires the leaf subject to name the device.
    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_ascii_lowercase());
        self
    }

    pub fn verify_chain(&self, chain: &[Vec<u8>]) -> BkpsResult<()> {
        let Some(root_der) = chain.last() else {
            return Err(self.policy.on_verification_failure("chain is empty."));
        };
        let certs = chain
            .iter()
            .map(|der| X509::from_der(der))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.policy.on_verification_failure("failed to parse certificate.").with_source(e))?;

        for (index, pair) in certs.windows(2).enumerate() {
            let (child, parent) = (&pair[0], &pair[1]);
            if !self.signed_by(child, parent)? {
                return Err(self.failure(&chain[index], "is not signed by its parent."));
            }
        }
        for (index, cert) in certs.iter().enumerate() {
            if !now_within(cert)? {
                return Err(self.failure(&chain[index], "is not within its validity period."));
            }
        }
        let root = &certs[certs.len() - 1];
        if !self.signed_by(root, root)? {
            return Err(self.policy.on_verification_failure("root certificate is not self-signed."));
        }
        if !RootHashVerifier::verify_root_hash(root_der, self.trusted_root_hash) {
            return Err(self.policy.on_verification_failure("root hash is not trusted."));
        }
        for index in 0..certs.len() - 1 {
            self.verify_not_revoked(&chain[index], &certs[index], &certs[index + 1])?;
        }
        self.verify_leaf(&chain[0])
    }

    fn signed_by(&self, cert: &X509, issuer: &X509) -> BkpsResult<bool> {
        let key = issuer
            .public_key()
            .map_err(|e| self.policy.on_verification_failure("failed to read public key.").with_source(e))?;
        Ok(cert.verify(&key).unwrap_or(false))
    }

    fn failure(&self, der: &[u8], what: &str) -> BkpsError {
        let subject = x509::subject(der).unwrap_or_default();
        self.policy
            .on_verification_failure(&format!("certificate {subject} {what}"))
    }

    fn verify_not_revoked(&self, der: &[u8], cert: &X509, issuer: &X509) -> BkpsResult<()> {
        for url in x509::crl_distribution_points(der)? {
            let crl = X509Crl::from_der(self.crl_provider.get_crl(&url)?)
                .map_err(|e| self.policy.on_verification_failure("failed to parse CRL.").with_source(e))?;
            let key = issuer
                .public_key()
                .map_err(|e| self.policy.on_verification_failure("failed to read public key.").with_source(e))?;
            if !crl.verify(&key).unwrap_or(false) {
                return Err(self.failure(der, &format!("has CRL {url} not signed by its issuer.")));
            }
            if let CrlStatus::Revoked(_) = crl.get_by_cert(cert) {
                return Err(self.failure(der, "is revoked."));
            }
        }
        Ok(())
    }

    fn verify_leaf(&self, leaf: &[u8]) -> BkpsResult<()> {
        let expected = self.policy.expected_leaf_key_purposes();
        if !expected.is_empty() {
            let purposes = x509::extended_key_usages(leaf)?;
            if !purposes.iter().any(|oid| expected.contains(&oid.as_str())) {
                return Err(self.failure(leaf, "does not have any of the expected key purposes."));
            }
        }
        if let Some(device_id) = &self.device_id {
            let subject = x509::subject(leaf)?.to_ascii_lowercase();
            if !subject.contains(device_id.as_str()) {
                return Err(self.failure(leaf, &format!("does not belong to device {device_id}.")));
            }
        }
        Ok(())
    }
}

/// Device chains ready for verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChainDto {
    /// EFUSE UDS chain, leaf first.
    pub certificates: Vec<Vec<u8>>,
    /// IID UDS chain, leaf first.
    pub certificates_iid: Vec<Vec<u8>>,
    pub cached_crls: BTreeMap<String, Vec<u8>>,
}

/// Verifies the chains collected during SIGMA provisioning.
#[derive(Debug, Clone, Default)]
pub struct CertificateChainVerifier {
    trusted_root_hash: Vec<String>,
}

impl CertificateChainVerifier {
    pub fn new(trusted_root_hash: Vec<String>) -> Self {
        Self { trusted_root_hash }
    }

    pub fn trusted_root_hash(&self) -> &[String] {
        &self.trusted_root_hash
    }

    pub fn verify_dice_chain(
        &self,
        device_id: &str,
        chain: &CertificateChainDto,
        require_iid_uds: bool,
        test_mode_secrets: bool,
    ) -> BkpsResult<()> {
        log::info!("Verifying DICE certificates chain...");
        if test_mode_secrets {
            log::info!("Configuration allows devices with test mode secrets.");
        }
        let crl_provider = PrePopulatedCrlProvider::new(&chain.cached_crls);
        let verifier = ChainVerifier::new(
            DiceBkpPolicy { test_mode_secrets },
            &crl_provider,
            &self.trusted_root_hash,
        )
        .with_device_id(device_id);

        Self::verify_required("EFUSE UDS", &chain.certificates, |c| verifier.verify_chain(c))?;
        let iid_required = chain
            .certificates
            .first()
            .is_some_and(|first| IidFlowDetector::with_require_iid_uds(require_iid_uds).is_iid_flow(first));
        if iid_required {
            Self::verify_required("IID UDS", &chain.certificates_iid, |c| verifier.verify_chain(c))?;
        }
        log::info!("Chain validation passed.");
        Ok(())
    }

    pub fn verify_s10_chain(&self, device_id: &str, chain: &CertificateChainDto) -> BkpsResult<()> {
        log::info!("Verifying S10 certificates chain...");
        let crl_provider = PrePopulatedCrlProvider::new(&chain.cached_crls);
        ChainVerifier::new(S10BkpPolicy, &crl_provider, &self.trusted_root_hash)
            .with_device_id(device_id)
            .verify_chain(&chain.certificates)?;
        log::info!("Chain validation passed.");
        Ok(())
    }

    fn verify_required(
        chain_type: &str,
        chain: &[Vec<u8>],
        verify: impl Fn(&[Vec<u8>]) -> BkpsResult<()>,
    ) -> BkpsResult<()> {
        if chain.is_empty() {
            return Err(BkpsError::new(
                ErrorKind::DEVICE_CHAIN_VERIFICATION_FAILED,
                format!("Required {chain_type} chain does not exist and cannot be verified."),
            ));
        }
        log::debug!("Verifying {chain_type} chain that has {} certificates.", chain.len());
        verify(chain)
    }
}
