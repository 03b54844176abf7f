// Licensed under the Apache-2.0 license

use super::protocol::SpdmProtocol;
use crate::chain::{
    x509, ChainVerifier, CrlFetcher, DiceBkpPolicy, DistributionPoint, IidFlowDetector,
    PrePopulatedCrlProvider, RootHashVerifier,
};
use crate::configuration::ServiceConfiguration;
use bkps_api::pad_to_boundary;
use bkps_api::spdm::{length_u16, SPDM_HASH_LEN};
use bkps_crypto::sha384;
use bkps_error::{raise_err, BkpsResult};
use std::collections::BTreeMap;
use std::sync::Arc;

const CHAIN_HEADER_LEN: usize = 4 + SPDM_HASH_LEN;
const IID_SUBJECT_MARKER: &str = "IID";

/// Certificate chain as stored in an SPDM slot:
///
/// ```text
/// | length LE (2) | reserved (2) | SHA-384 of root (48) | DER certificates, root first |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmCertChain {
    pub root_hash: [u8; SPDM_HASH_LEN],
    /// Root first.
    pub certificates: Vec<Vec<u8>>,
}

impl SpdmCertChain {
    pub fn new(certificates: Vec<Vec<u8>>) -> BkpsResult<Self> {
        let Some(root) = certificates.first() else {
            raise_err!(CODEC_INVALID_LENGTH, "SPDM certificate chain has no certificates.");
        };
        Ok(Self {
            root_hash: sha384(root),
            certificates,
        })
    }

    pub fn from_leaf_first(chain: &[Vec<u8>]) -> BkpsResult<Self> {
        Self::new(chain.iter().rev().cloned().collect())
    }

    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let len = CHAIN_HEADER_LEN + self.certificates.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&length_u16(len, "SPDM certificate chain")?);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.root_hash);
        for certificate in &self.certificates {
            out.extend_from_slice(certificate);
        }
        Ok(out)
    }

    /// SET_CERTIFICATE payload, padded to whole mailbox words.
    pub fn build_padded(&self) -> BkpsResult<Vec<u8>> {
        Ok(pad_to_boundary(&self.build()?, 4))
    }

    /// Bytes past the declared length are padding and ignored.
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let Some(len) = bytes.get(..2).map(|b| usize::from(u16::from_le_bytes([b[0], b[1]]))) else {
            raise_err!(CODEC_BUFFER_TOO_SHORT, "SPDM certificate chain has no length field.");
        };
        if len < CHAIN_HEADER_LEN || len > bytes.len() {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "SPDM certificate chain declares {len} bytes but carries {}.",
                bytes.len()
            );
        }
        let mut root_hash = [0u8; SPDM_HASH_LEN];
        root_hash.copy_from_slice(&bytes[4..CHAIN_HEADER_LEN]);
        let certificates = x509::split_certificates(&bytes[CHAIN_HEADER_LEN..len])?;
        let chain = Self {
            root_hash,
            certificates,
        };
        match chain.certificates.first() {
            Some(root) if sha384(root) == chain.root_hash => Ok(chain),
            Some(_) => raise_err!(
                CODEC_INVALID_ENCODING,
                "SPDM certificate chain root hash does not match its root certificate."
            ),
            None => raise_err!(CODEC_INVALID_LENGTH, "SPDM certificate chain has no certificates."),
        }
    }

    pub fn root(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.certificates.last().map(Vec::as_slice)
    }

    pub fn leaf_first(&self) -> Vec<Vec<u8>> {
        self.certificates.iter().rev().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpdmChainType {
    Attestation,
    Iid,
}

impl SpdmChainType {
    pub fn classify(leaf_first: &[Vec<u8>]) -> Self {
        let iid = leaf_first
            .iter()
            .filter_map(|der| x509::subject(der).ok())
            .any(|subject| subject.contains(IID_SUBJECT_MARKER));
        if iid {
            Self::Iid
        } else {
            Self::Attestation
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChain {
    pub slot_id: u8,
    /// Leaf first.
    pub certificates: Vec<Vec<u8>>,
}

/// Verified chains by type. The first slot found for a type wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpdmValidChains {
    chains: BTreeMap<SpdmChainType, SlotChain>,
}

impl SpdmValidChains {
    pub fn insert(&mut self, chain_type: SpdmChainType, chain: SlotChain) {
        self.chains.entry(chain_type).or_insert(chain);
    }

    pub fn get(&self, chain_type: SpdmChainType) -> Option<&SlotChain> {
        self.chains.get(&chain_type)
    }

    pub fn contains(&self, chain_type: SpdmChainType) -> bool {
        self.chains.contains_key(&chain_type)
    }

    pub fn attestation_slot(&self) -> Option<u8> {
        self.get(SpdmChainType::Attestation).map(|chain| chain.slot_id)
    }

    /// Attestation chain found, plus the IID chain when the device family
    /// carries one and the configuration requires it.
    pub fn is_complete(&self, require_iid_uds: bool) -> bool {
        let Some(attestation) = self.get(SpdmChainType::Attestation) else {
            return false;
        };
        let iid_needed = attestation
            .certificates
            .first()
            .is_some_and(|leaf| IidFlowDetector::with_require_iid_uds(require_iid_uds).is_iid_flow(leaf));
        !iid_needed || self.contains(SpdmChainType::Iid)
    }
}

/// Walks the responder slots for chains the service trusts.
pub struct SpdmChainSearcher {
    crl_fetcher: CrlFetcher,
    trusted_root_hash: Vec<String>,
}

impl SpdmChainSearcher {
    pub fn new(connector: Arc<dyn DistributionPoint>, trusted_root_hash: Vec<String>) -> Self {
        Self {
            crl_fetcher: CrlFetcher::new(connector),
            trusted_root_hash,
        }
    }

    /// Stops at the first slot completing the required chain set. A slot
    /// whose chain does not parse or verify is skipped; transport errors
    /// abort the search.
    pub fn search(
        &self,
        protocol: &mut dyn SpdmProtocol,
        device_id: &str,
        configuration: &ServiceConfiguration,
    ) -> BkpsResult<SpdmValidChains> {
        log::info!("Searching for valid certificate chains of device {device_id}...");
        let mut valid = SpdmValidChains::default();
        for slot_id in protocol.get_digests()? {
            if valid.is_complete(configuration.require_iid_uds) {
                break;
            }
            let raw = protocol.get_certificate(slot_id)?;
            match self.verify_slot(&raw, device_id, configuration) {
                Ok(certificates) => {
                    let chain_type = SpdmChainType::classify(&certificates);
                    log::info!("Slot {slot_id} holds a valid {chain_type:?} chain.");
                    valid.insert(chain_type, SlotChain { slot_id, certificates });
                }
                Err(e) => log::warn!("Skipping certificate chain in slot {slot_id}: {e}"),
            }
        }
        if !valid.is_complete(configuration.require_iid_uds) {
            raise_err!(ATTESTATION_FAILED, "Valid attestation chain not found.");
        }
        Ok(valid)
    }

    fn verify_slot(
        &self,
        raw: &[u8],
        device_id: &str,
        configuration: &ServiceConfiguration,
    ) -> BkpsResult<Vec<Vec<u8>>> {
        let chain = SpdmCertChain::parse(raw)?;
        let Some(root) = chain.root() else {
            raise_err!(CODEC_INVALID_LENGTH, "SPDM certificate chain has no certificates.");
        };
        if !RootHashVerifier::verify_root_hash(root, &self.trusted_root_hash) {
            raise_err!(DEVICE_CHAIN_VERIFICATION_FAILED, "Root certificate is not trusted.");
        }
        let certificates = chain.leaf_first();
        let crls: BTreeMap<String, Vec<u8>> = self.crl_fetcher.fetch_crls(&certificates).into_iter().collect();
        let crl_provider = PrePopulatedCrlProvider::new(&crls);
        let policy = DiceBkpPolicy {
            test_mode_secrets: configuration.test_mode_secrets,
        };
        ChainVerifier::new(policy, &crl_provider, &self.trusted_root_hash)
            .with_device_id(device_id)
            .verify_chain(&certificates)?;
        Ok(certificates)
    }
}
