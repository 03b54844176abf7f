// Licensed under the Apache-2.0 license

use super::dp::{CacheFetcher, DistributionPoint, DpCertificate, DpCrl};
use super::x509;
use crate::config::{build_path, DistributionPointConfig};
use crate::configuration::PufType;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::collections::BTreeMap;
use std::sync::Arc;

const MAX_CHAIN_DEPTH: usize = 8;
const IID_FAMILY_MARKER: &str = "Agilex";

/// Certificates and CRLs prefetched from the distribution point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpChainData {
    /// EFUSE UDS chain, first certificate closest to the device.
    pub certificates: Vec<Vec<u8>>,
    /// IID UDS chain, same order.
    pub certificates_iid: Vec<Vec<u8>>,
    /// CRL DER by url.
    pub crls: BTreeMap<String, Vec<u8>>,
}

/// Decides whether the device family carries the IID UDS chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct IidFlowDetector {
    require_iid_uds: bool,
}

impl IidFlowDetector {
    pub fn new() -> Self {
        Self {
            require_iid_uds: true,
        }
    }

    pub fn with_require_iid_uds(require_iid_uds: bool) -> Self {
        Self { require_iid_uds }
    }

    pub fn is_iid_flow(&self, certificate: &[u8]) -> bool {
        if !self.require_iid_uds {
            return false;
        }
        match x509::subject(certificate) {
            Ok(subject) => subject.contains(IID_FAMILY_MARKER),
            Err(e) => {
                log::warn!("Failed to read certificate subject: {e}");
                false
            }
        }
    }
}

/// Follows caIssuers links from a certificate up to the root.
pub struct ChainFetcher {
    certificates: CacheFetcher<DpCertificate>,
}

impl ChainFetcher {
    pub fn new(connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            certificates: CacheFetcher::new(connector),
        }
    }

    pub fn fetch_certificate(&self, url: &str) -> Option<Vec<u8>> {
        self.certificates.fetch(url).map(|cert| cert.0)
    }

    /// Chain starting with the certificate at `url`.
    pub fn fetch_certificate_chain_from_url(&self, url: &str) -> Vec<Vec<u8>> {
        let Some(first) = self.fetch_certificate(url) else {
            log::warn!("Failed to download certificate from {url}");
            return Vec::new();
        };
        let mut chain = vec![first.clone()];
        chain.extend(self.fetch_parents(&first));
        chain
    }

    /// Parents of `certificate`, closest first. Stops at a self issued
    /// certificate or when no issuer url is published.
    pub fn fetch_parents(&self, certificate: &[u8]) -> Vec<Vec<u8>> {
        let mut parents = Vec::new();
        let mut current = certificate.to_vec();
        while parents.len() < MAX_CHAIN_DEPTH {
            if x509::is_self_issued(&current).unwrap_or(true) {
                break;
            }
            let urls = x509::ca_issuers(&current).unwrap_or_default();
            let Some(url) = urls.first() else {
                break;
            };
            let Some(parent) = self.fetch_certificate(url) else {
                log::warn!("Failed to download parent certificate from {url}");
                break;
            };
            parents.push(parent.clone());
            current = parent;
        }
        parents
    }
}

/// Downloads the CRLs referenced by certificates.
pub struct CrlFetcher {
    crls: CacheFetcher<DpCrl>,
}

impl CrlFetcher {
    pub fn new(connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            crls: CacheFetcher::new(connector),
        }
    }

    pub fn fetch_crl(&self, url: &str) -> Option<Vec<u8>> {
        self.crls.fetch(url).map(|crl| crl.0)
    }

    /// CRLs by url in the order the chain references them. Missing CRLs are
    /// skipped; the verifier reports them if a certificate needs one.
    pub fn fetch_crls(&self, chain: &[Vec<u8>]) -> Vec<(String, Vec<u8>)> {
        let mut crls: Vec<(String, Vec<u8>)> = Vec::new();
        for cert in chain {
            for url in x509::crl_distribution_points(cert).unwrap_or_default() {
                if crls.iter().any(|(known, _)| *known == url) {
                    continue;
                }
                match self.fetch_crl(&url) {
                    Some(crl) => crls.push((url, crl)),
                    None => log::warn!("Failed to download CRL from {url}"),
                }
            }
        }
        crls
    }
}

fn key_id_segment(id: Option<Vec<u8>>, name: &str) -> BkpsResult<String> {
    match id {
        Some(id) => Ok(URL_SAFE_NO_PAD.encode(id)),
        None => raise_err!(
            CHAIN_DOWNLOAD_FAILED,
            "Device id enrollment certificate has no {name}."
        ),
    }
}

/// Url layout of device certificates on the distribution point.
#[derive(Debug, Clone)]
pub struct DistributionPointAddressProvider {
    attestation_url: String,
}

impl DistributionPointAddressProvider {
    pub fn new(attestation_url: impl Into<String>) -> Self {
        Self {
            attestation_url: attestation_url.into(),
        }
    }

    fn cert_url(&self, file: &str) -> String {
        build_path(&self.attestation_url, &format!("certs/{file}"))
    }

    pub fn device_id_cert_url(&self, device_id: &str, ski: &str) -> String {
        self.cert_url(&format!("deviceid_{device_id}_{ski}.cer"))
    }

    pub fn enrollment_cert_url(&self, device_id: &str, aki: &str) -> String {
        self.cert_url(&format!("enrollment_{device_id}_00_{aki}.cer"))
    }

    pub fn iid_uds_cert_url(&self, device_id: &str, aki: &str) -> String {
        self.cert_url(&format!("iiduds_{device_id}_{aki}.cer"))
    }

    pub fn s10_attestation_cert_url(&self, device_id: &str, puf_type: PufType) -> String {
        self.cert_url(&format!("attestation_{device_id}_{}.cer", puf_type.hex()))
    }
}

/// Prefetches the DICE chains of a device identified by its device id
/// enrollment certificate.
pub struct DiceDpFetchService {
    addresses: DistributionPointAddressProvider,
    chains: ChainFetcher,
    crls: CrlFetcher,
    iid_flow_detector: IidFlowDetector,
}

impl DiceDpFetchService {
    pub fn new(config: &DistributionPointConfig, connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            addresses: DistributionPointAddressProvider::new(config.attestation_url()),
            chains: ChainFetcher::new(connector.clone()),
            crls: CrlFetcher::new(connector),
            iid_flow_detector: IidFlowDetector::new(),
        }
    }

    pub fn fetch(&self, device_id: &str, enrollment_cert: &[u8]) -> BkpsResult<DpChainData> {
        let efuse_chain = self.fetch_efuse_uds_chain(device_id, enrollment_cert)?;
        let iid_chain = if self.iid_flow_detector.is_iid_flow(enrollment_cert) {
            self.fetch_iid_uds_chain(device_id, enrollment_cert)?
        } else {
            Vec::new()
        };
        if efuse_chain.is_empty() && iid_chain.is_empty() {
            raise_err!(
                CHAIN_DOWNLOAD_FAILED,
                "Failed to download at least one full chain (EFUSE or IID UDS)."
            );
        }
        let not_empty = if efuse_chain.is_empty() {
            &iid_chain
        } else {
            &efuse_chain
        };
        let mut crls = self.crls.fetch_crls(not_empty);
        if let Some((first_url, _)) = crls.first() {
            let l1_url = first_url.replace(".crl", "_L1.crl");
            match self.crls.fetch_crl(&l1_url) {
                Some(crl) => crls.push((l1_url, crl)),
                None => log::warn!("Failed to download CRL from {l1_url}"),
            }
        }
        Ok(DpChainData {
            certificates: efuse_chain,
            certificates_iid: iid_chain,
            crls: crls.into_iter().collect(),
        })
    }

    fn fetch_efuse_uds_chain(&self, device_id: &str, enrollment_cert: &[u8]) -> BkpsResult<Vec<Vec<u8>>> {
        let ski = key_id_segment(x509::subject_key_identifier(enrollment_cert)?, "SKI")?;
        let aki = key_id_segment(x509::authority_key_identifier(enrollment_cert)?, "AKI")?;
        let first = self
            .chains
            .fetch_certificate(&self.addresses.device_id_cert_url(device_id, &ski))
            .or_else(|| {
                self.chains
                    .fetch_certificate(&self.addresses.enrollment_cert_url(device_id, &aki))
            });
        Ok(self.complete_chain("EFUSE UDS", first))
    }

    fn fetch_iid_uds_chain(&self, device_id: &str, enrollment_cert: &[u8]) -> BkpsResult<Vec<Vec<u8>>> {
        let aki = key_id_segment(x509::authority_key_identifier(enrollment_cert)?, "AKI")?;
        let first = self
            .chains
            .fetch_certificate(&self.addresses.iid_uds_cert_url(device_id, &aki));
        Ok(self.complete_chain("IID UDS", first))
    }

    fn complete_chain(&self, chain_type: &str, first: Option<Vec<u8>>) -> Vec<Vec<u8>> {
        let Some(first) = first else {
            log::warn!("Failed to download first certificate of {chain_type} chain.");
            return Vec::new();
        };
        let mut chain = vec![first.clone()];
        chain.extend(self.chains.fetch_parents(&first));
        chain
    }
}

/// Prefetches the S10 attestation chain of a device.
pub struct S10DpFetchService {
    addresses: DistributionPointAddressProvider,
    chains: ChainFetcher,
    crls: CrlFetcher,
}

impl S10DpFetchService {
    pub fn new(config: &DistributionPointConfig, connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            addresses: DistributionPointAddressProvider::new(config.attestation_url()),
            chains: ChainFetcher::new(connector.clone()),
            crls: CrlFetcher::new(connector),
        }
    }

    pub fn fetch(&self, device_id: &str) -> BkpsResult<DpChainData> {
        log::debug!("Building PufAttestation certificate chain.");
        let url = self
            .addresses
            .s10_attestation_cert_url(device_id, PufType::Efuse);
        let certificates = self.chains.fetch_certificate_chain_from_url(&url);
        if certificates.is_empty() {
            return Err(BkpsError::new(
                ErrorKind::CHAIN_DOWNLOAD_FAILED,
                format!("Failed to download S10 attestation certificate chain for device {device_id}."),
            ));
        }
        let crls = self.crls.fetch_crls(&certificates);
        Ok(DpChainData {
            certificates,
            certificates_iid: Vec::new(),
            crls: crls.into_iter().collect(),
        })
    }
}
