// Licensed under the Apache-2.0 license

use bkps_crypto::{ecdsa_der_to_raw, SecurityEnclave, ECC384_SIGNATURE_LEN};
use bkps_error::{raise_err, BkpsResult};
use std::sync::Arc;

/// The service signing identity presented to devices in M1 and proven in
/// M3. The signing key stays inside the enclave.
#[derive(Clone)]
pub struct ServiceIdentity {
    enclave: Arc<dyn SecurityEnclave>,
    signing_alias: String,
    /// DER certificates, root first.
    chain: Vec<Vec<u8>>,
}

impl ServiceIdentity {
    pub fn new(
        enclave: Arc<dyn SecurityEnclave>,
        signing_alias: impl Into<String>,
        chain: Vec<Vec<u8>>,
    ) -> BkpsResult<Self> {
        let signing_alias = signing_alias.into();
        if chain.is_empty() {
            raise_err!(PROVISIONING_GENERIC, "Service certificate chain is empty.");
        }
        if !enclave.exists(&signing_alias) {
            raise_err!(
                ENCLAVE_OBJECT_NOT_FOUND,
                "Service signing key {signing_alias} does not exist."
            );
        }
        Ok(Self {
            enclave,
            signing_alias,
            chain,
        })
    }

    /// Concatenated chain as carried after the fixed part of M1.
    pub fn chain_bytes(&self) -> Vec<u8> {
        self.chain.concat()
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// ECDSA-SHA384 signature in the raw `r || s` form SIGMA carries.
    pub fn sign_raw(&self, data: &[u8]) -> BkpsResult<[u8; ECC384_SIGNATURE_LEN]> {
        let der = self.enclave.sign(&self.signing_alias, data)?;
        ecdsa_der_to_raw(&der)
    }
}

/// Identity backed by a fresh enclave key and a generated chain.
#[cfg(test)]
pub(crate) fn test_identity(enclave: Arc<dyn SecurityEnclave>) -> ServiceIdentity {
    enclave
        .create_object("service-signing", bkps_crypto::SecurityObjectType::Ec384)
        .unwrap();
    let chain = crate::testing::service_chain(&enclave.public_key("service-signing").unwrap());
    ServiceIdentity::new(enclave, "service-signing", chain).unwrap()
}
