// Licensed under the Apache-2.0 license

use bkps_api::spdm::{SpdmAlgorithms, BASE_ASYM_ECDSA_P384, BASE_HASH_SHA384, SPDM_SIGNATURE_LEN};
use bkps_crypto::{ecdsa_der_to_raw, sha384, SecurityEnclave};
use bkps_error::{raise_err, BkpsResult};
use std::sync::Arc;

const SIGNING_PREFIX: &[u8; 16] = b"dmtf-spdm-v1.2.*";
const SIGNING_CONTEXT_LEN: usize = 36;

pub const KEY_EXCHANGE_RSP_SIGNING_CONTEXT: &str = "responder-key_exchange_rsp signing";
pub const FINISH_SIGNING_CONTEXT: &str = "requester-finish signing";
pub const MEASUREMENTS_SIGNING_CONTEXT: &str = "responder-measurements signing";

/// SPDM 1.2 signed data: the version prefix four times, the zero padded
/// context string and the transcript hash.
pub fn spdm_signing_data(context: &str, transcript: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 * SIGNING_PREFIX.len() + SIGNING_CONTEXT_LEN + 48);
    for _ in 0..4 {
        data.extend_from_slice(SIGNING_PREFIX);
    }
    data.resize(data.len() + SIGNING_CONTEXT_LEN.saturating_sub(context.len()), 0);
    data.extend_from_slice(context.as_bytes());
    data.extend_from_slice(&sha384(transcript));
    data
}

/// Signs FINISH for responders asking for mutual authentication. The
/// private key never leaves the enclave.
pub struct FinishMessageSigner {
    enclave: Arc<dyn SecurityEnclave>,
    alias: String,
}

impl FinishMessageSigner {
    pub fn new(enclave: Arc<dyn SecurityEnclave>, alias: impl Into<String>) -> Self {
        Self {
            enclave,
            alias: alias.into(),
        }
    }

    pub fn sign(
        &self,
        algorithms: &SpdmAlgorithms,
        transcript: &[u8],
    ) -> BkpsResult<[u8; SPDM_SIGNATURE_LEN]> {
        if algorithms.base_asym_algo != BASE_ASYM_ECDSA_P384 || algorithms.base_hash_algo != BASE_HASH_SHA384 {
            raise_err!(
                UNSUPPORTED_ALGORITHM,
                "Signing with asymmetric algorithm 0x{:x} and hash algorithm 0x{:x} is not supported.",
                algorithms.base_asym_algo,
                algorithms.base_hash_algo
            );
        }
        log::debug!("Signing SPDM FINISH message.");
        let der = self
            .enclave
            .sign(&self.alias, &spdm_signing_data(FINISH_SIGNING_CONTEXT, transcript))?;
        ecdsa_der_to_raw(&der)
    }
}
