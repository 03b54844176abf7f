// Licensed under the Apache-2.0 license

use super::dp::DistributionPoint;
use super::fetch::{DiceDpFetchService, DpChainData, S10DpFetchService};
use super::verifier::CertificateChainDto;
use super::x509;
use crate::config::DistributionPointConfig;
use bkps_api::{CertificateRequestType, CommandId, CommandLayer, GetCertificateResponse, ProgrammerResponseAdapter};
use bkps_error::{raise_err, BkpsResult};
use std::sync::Arc;

/// Tells whether the device id enrollment certificate has to be spliced
/// into the EFUSE chain.
pub struct EnrollmentFlowDetector;

impl EnrollmentFlowDetector {
    /// The firmware certificate is signed by the first certificate from the
    /// distribution point unless the device went through enrollment.
    pub fn is_enrollment_flow(firmware_cert: &[u8], fetched: &DpChainData) -> BkpsResult<bool> {
        log::debug!("Verifying if enrollment flow.");
        let Some(first_from_dp) = fetched.certificates.first() else {
            log::warn!("EFUSE UDS chain was not fetched, enrollment flow cannot be detected.");
            return Ok(false);
        };
        let ski = x509::subject_key_identifier(first_from_dp)?;
        let aki = x509::authority_key_identifier(firmware_cert)?;
        log::debug!(
            "Comparing firmware certificate AKI {} with SKI {} of {}",
            hex::encode(aki.as_deref().unwrap_or_default()),
            hex::encode(ski.as_deref().unwrap_or_default()),
            x509::subject(first_from_dp).unwrap_or_default()
        );
        Ok(aki != ski)
    }
}

/// Assembles device chains from GET_ATTESTATION_CERTIFICATE responses and
/// distribution point certificates.
pub struct CertificateChainCreator {
    dice: DiceDpFetchService,
    s10: S10DpFetchService,
}

impl CertificateChainCreator {
    pub fn new(config: &DistributionPointConfig, connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            dice: DiceDpFetchService::new(config, connector.clone()),
            s10: S10DpFetchService::new(config, connector),
        }
    }

    /// Downloads the DICE chains ahead of the device certificates so a
    /// missing chain fails the flow before M1 goes out.
    pub fn prefetch_dice(&self, device_id: &str, enrollment_cert: &[u8]) -> BkpsResult<DpChainData> {
        self.dice.fetch(device_id, enrollment_cert)
    }

    pub fn prefetch_s10(&self, device_id: &str) -> BkpsResult<DpChainData> {
        self.s10.fetch(device_id)
    }

    pub fn create_s10_chain(&self, device_id: &str) -> BkpsResult<CertificateChainDto> {
        log::info!("Preparing S10 certificates chain...");
        let fetched = self.s10.fetch(device_id)?;
        Ok(CertificateChainDto {
            certificates: fetched.certificates,
            certificates_iid: Vec::new(),
            cached_crls: fetched.crls,
        })
    }

    /// Consumes the UDS_EFUSE_BKP and FIRMWARE responses, then the
    /// UDS_IID_PUF_BKP response when `require_iid_uds` is set.
    pub fn create_dice_chain(
        &self,
        adapter: &mut ProgrammerResponseAdapter,
        device_id: &str,
        enrollment_cert: &[u8],
        require_iid_uds: bool,
    ) -> BkpsResult<CertificateChainDto> {
        log::info!("Preparing DICE certificates chain...");
        let fetched = self.dice.fetch(device_id, enrollment_cert)?;
        let certificates = Self::create_efuse_chain(adapter, &fetched, enrollment_cert)?;
        let certificates_iid = Self::create_iid_chain(adapter, &fetched, require_iid_uds)?;
        Ok(CertificateChainDto {
            certificates,
            certificates_iid,
            cached_crls: fetched.crls,
        })
    }

    fn create_efuse_chain(
        adapter: &mut ProgrammerResponseAdapter,
        fetched: &DpChainData,
        enrollment_cert: &[u8],
    ) -> BkpsResult<Vec<Vec<u8>>> {
        let mut chain = vec![Self::certificate_from_response(
            adapter,
            CertificateRequestType::UDS_EFUSE_BKP,
        )?];
        let firmware = Self::certificate_from_response(adapter, CertificateRequestType::FIRMWARE)?;
        let enrollment_flow = EnrollmentFlowDetector::is_enrollment_flow(&firmware, fetched)?;
        chain.push(firmware);
        if enrollment_flow {
            log::debug!("This is enrollment certificate chain flow, adding deviceIdEnrollment certificate to chain.");
            chain.push(enrollment_cert.to_vec());
        }
        if fetched.certificates.is_empty() {
            return Ok(Vec::new());
        }
        chain.extend(fetched.certificates.iter().cloned());
        Ok(chain)
    }

    fn create_iid_chain(
        adapter: &mut ProgrammerResponseAdapter,
        fetched: &DpChainData,
        require_iid_uds: bool,
    ) -> BkpsResult<Vec<Vec<u8>>> {
        if !require_iid_uds {
            return Ok(Vec::new());
        }
        log::debug!("This is IID certificate chain flow.");
        let device_cert =
            Self::certificate_from_response(adapter, CertificateRequestType::UDS_IID_PUF_BKP)?;
        if fetched.certificates_iid.is_empty() {
            return Ok(Vec::new());
        }
        let mut chain = vec![device_cert];
        chain.extend(fetched.certificates_iid.iter().cloned());
        Ok(chain)
    }

    fn certificate_from_response(
        adapter: &mut ProgrammerResponseAdapter,
        expected: CertificateRequestType,
    ) -> BkpsResult<Vec<u8>> {
        let body = CommandLayer::retrieve(adapter.next_response()?, CommandId::GET_ATTESTATION_CERTIFICATE)?;
        let response = GetCertificateResponse::parse(body)?;
        if response.certificate_type != expected {
            raise_err!(
                CERTIFICATE_REQUEST_TYPE_MISMATCH,
                "Certificate type mismatch. Expected: {}, actual: {}.",
                expected.name(),
                response.certificate_type.name()
            );
        }
        x509::leading_certificate(&response.certificate_blob)
    }
}
