// Licensed under the Apache-2.0 license

use super::chain::SpdmCertChain;
use super::session::{SpdmHandshake, SpdmSession};
use super::signer::{
    spdm_signing_data, FinishMessageSigner, KEY_EXCHANGE_RSP_SIGNING_CONTEXT, MEASUREMENTS_SIGNING_CONTEXT,
};
use super::transport::SpdmTransport;
use bkps_api::spdm::{
    spdm_get_version, SpdmAlgorithms, SpdmCapabilities, SpdmCapabilitiesMessage, SpdmCertificateResponse,
    SpdmCode, SpdmDigestsResponse, SpdmFinish, SpdmGetCertificate, SpdmGetMeasurements, SpdmHeader,
    SpdmKeyExchange, SpdmKeyExchangeResponse, SpdmMeasurementsResponse, SpdmSetCertificate,
    SpdmVendorDefined, SpdmVersionResponse, AEAD_AES_256_GCM, DHE_SECP384R1, SPDM_HASH_LEN,
    SPDM_SIGNATURE_LEN, SPDM_VERSION_12,
};
use bkps_api::{MctpMessage, MctpMessageType};
use bkps_crypto::{ecdsa_verify_raw, sha384, EcdhKeyPair};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use openssl::x509::X509;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Version the service speaks, as major/minor hex digits.
pub const SUPPORTED_SPDM_VERSION: &str = "12";

const CERTIFICATE_PORTION_LEN: u16 = 0x400;
const REQUESTER_DATA_TRANSFER_SIZE: u32 = 4096;

/// Requester side of the SPDM operations the provisioning flows use.
pub trait SpdmProtocol {
    /// Negotiated version as major/minor hex digits.
    fn get_version(&mut self) -> BkpsResult<String>;

    fn get_capabilities(&mut self) -> BkpsResult<SpdmCapabilities>;

    fn negotiate_algorithms(&mut self) -> BkpsResult<SpdmAlgorithms>;

    /// Slots holding a certificate chain.
    fn get_digests(&mut self) -> BkpsResult<Vec<u8>>;

    /// Certificate chain payload of `slot_id`.
    fn get_certificate(&mut self, slot_id: u8) -> BkpsResult<Vec<u8>>;

    /// Signed measurements, verified with the leaf key of `slot_id`.
    fn get_measurements(&mut self, slot_id: u8) -> BkpsResult<SpdmMeasurementsResponse>;

    /// KEY_EXCHANGE and FINISH with the responder key of `slot_id`.
    /// Returns the measurement summary hash the responder signed.
    fn start_session(&mut self, slot_id: u8) -> BkpsResult<[u8; SPDM_HASH_LEN]>;

    /// Sends a mailbox command inside the session and returns the mailbox
    /// response.
    fn send_data(&mut self, payload: &[u8]) -> BkpsResult<Vec<u8>>;

    fn end_session(&mut self) -> BkpsResult<()>;

    fn set_certificate(&mut self, slot_id: u8, cert_chain: &[u8]) -> BkpsResult<()>;
}

fn attestation_failed(message: &str) -> impl FnOnce(BkpsError) -> BkpsError + '_ {
    move |e| BkpsError::new(ErrorKind::ATTESTATION_FAILED, message).with_source(e)
}

/// SPDM 1.2 requester over an MCTP transport.
pub struct SpdmRequester {
    transport: Arc<dyn SpdmTransport>,
    signer: Option<Arc<FinishMessageSigner>>,
    algorithms: Option<SpdmAlgorithms>,
    /// GET_VERSION through ALGORITHMS.
    message_a: Vec<u8>,
    cert_chains: BTreeMap<u8, Vec<u8>>,
    session: Option<SpdmSession>,
    next_req_session_id: u16,
}

impl SpdmRequester {
    pub fn new(transport: Arc<dyn SpdmTransport>, signer: Option<Arc<FinishMessageSigner>>) -> Self {
        Self {
            transport,
            signer,
            algorithms: None,
            message_a: Vec::new(),
            cert_chains: BTreeMap::new(),
            session: None,
            next_req_session_id: 0xFFFF,
        }
    }

    fn exchange(&mut self, request: &[u8]) -> BkpsResult<Vec<u8>> {
        let (message_type, payload) = match &mut self.session {
            Some(session) => {
                let mut app_data = vec![MctpMessageType::SPDM.0];
                app_data.extend_from_slice(request);
                (MctpMessageType::SECURED_SPDM, session.seal(&app_data)?)
            }
            None => (MctpMessageType::SPDM, request.to_vec()),
        };
        self.transport.send_message(MctpMessage::new(message_type, payload));
        let Some(response) = self.transport.receive_response()? else {
            raise_err!(SPDM_NOT_SUPPORTED, "SPDM is not supported on this platform.");
        };
        if response.message_type != message_type {
            raise_err!(
                SPDM_COMMAND_FAILED,
                "Responder answered with MCTP message type 0x{:02x}, expected 0x{:02x}.",
                response.message_type.0,
                message_type.0
            );
        }
        let Some(session) = &mut self.session else {
            return Ok(response.payload);
        };
        let app_data = session.open(&response.payload)?;
        match app_data.split_first() {
            Some((&message_type, spdm)) if message_type == MctpMessageType::SPDM.0 => Ok(spdm.to_vec()),
            _ => raise_err!(SPDM_COMMAND_FAILED, "Secured message does not carry an SPDM message."),
        }
    }

    fn algorithms(&self) -> BkpsResult<SpdmAlgorithms> {
        match self.algorithms {
            Some(algorithms) => Ok(algorithms),
            None => raise_err!(SPDM_COMMAND_FAILED, "SPDM algorithms were not negotiated."),
        }
    }

    fn cert_chain(&self, slot_id: u8) -> BkpsResult<(&[u8], SpdmCertChain)> {
        let Some(raw) = self.cert_chains.get(&slot_id) else {
            raise_err!(
                ATTESTATION_FAILED,
                "Certificate chain of slot {slot_id} was not retrieved."
            );
        };
        Ok((raw.as_slice(), SpdmCertChain::parse(raw)?))
    }

    fn verify_responder_signature(
        &self,
        slot_id: u8,
        context: &str,
        transcript: &[u8],
        signature: &[u8],
    ) -> BkpsResult<()> {
        let (_, chain) = self.cert_chain(slot_id)?;
        let Some(leaf) = chain.leaf() else {
            raise_err!(ATTESTATION_FAILED, "Certificate chain of slot {slot_id} is empty.");
        };
        let failed = attestation_failed("Invalid responder certificate.");
        let key = X509::from_der(leaf)
            .and_then(|cert| cert.public_key())
            .map_err(|e| failed(BkpsError::new(ErrorKind::CRYPTO_FAILURE, "Invalid leaf.").with_source(e)))?;
        let valid = ecdsa_verify_raw(&key, &spdm_signing_data(context, transcript), signature)
            .map_err(attestation_failed("Responder signature verification failed."))?;
        if !valid {
            raise_err!(
                ATTESTATION_FAILED,
                "Responder signature ({context}) verification failed."
            );
        }
        Ok(())
    }
}

impl SpdmProtocol for SpdmRequester {
    fn get_version(&mut self) -> BkpsResult<String> {
        self.session = None;
        self.message_a.clear();
        let request = spdm_get_version();
        let response = self.exchange(&request)?;
        let versions = SpdmVersionResponse::parse(&response)?.versions;
        let Some(version) = versions.iter().copied().filter(|v| *v <= SPDM_VERSION_12).max() else {
            raise_err!(
                SPDM_UNSUPPORTED_VERSION,
                "Responder offers no SPDM version this service supports: {versions:02x?}."
            );
        };
        let version = format!("{version:02x}");
        if version != SUPPORTED_SPDM_VERSION {
            raise_err!(
                SPDM_UNSUPPORTED_VERSION,
                "Responder SPDM version: {version}, supported version: {SUPPORTED_SPDM_VERSION}."
            );
        }
        self.message_a.extend_from_slice(&request);
        self.message_a.extend_from_slice(&response);
        Ok(version)
    }

    fn get_capabilities(&mut self) -> BkpsResult<SpdmCapabilities> {
        let request = SpdmCapabilitiesMessage {
            ct_exponent: 0,
            flags: SpdmCapabilities::CERT_CAP
                | SpdmCapabilities::CHAL_CAP
                | SpdmCapabilities::ENCRYPT_CAP
                | SpdmCapabilities::MAC_CAP
                | SpdmCapabilities::MUT_AUTH_CAP
                | SpdmCapabilities::KEY_EX_CAP,
            data_transfer_size: REQUESTER_DATA_TRANSFER_SIZE,
            max_message_size: REQUESTER_DATA_TRANSFER_SIZE,
        }
        .build(SpdmCode::GET_CAPABILITIES);
        let response = self.exchange(&request)?;
        let capabilities = SpdmCapabilitiesMessage::parse(&response, SpdmCode::CAPABILITIES)?;
        self.message_a.extend_from_slice(&request);
        self.message_a.extend_from_slice(&response);
        Ok(capabilities.flags)
    }

    fn negotiate_algorithms(&mut self) -> BkpsResult<SpdmAlgorithms> {
        let request = SpdmAlgorithms::default().build_request();
        let response = self.exchange(&request)?;
        let algorithms = SpdmAlgorithms::parse_response(&response)?;
        log::debug!("Negotiated SPDM algorithms: {algorithms:x?}");
        self.message_a.extend_from_slice(&request);
        self.message_a.extend_from_slice(&response);
        self.algorithms = Some(algorithms);
        Ok(algorithms)
    }

    fn get_digests(&mut self) -> BkpsResult<Vec<u8>> {
        let response = self.exchange(&SpdmHeader::new(SpdmCode::GET_DIGESTS, 0, 0).build())?;
        Ok(SpdmDigestsResponse::parse(&response)?.slots())
    }

    fn get_certificate(&mut self, slot_id: u8) -> BkpsResult<Vec<u8>> {
        let mut chain = Vec::new();
        loop {
            let Ok(offset) = u16::try_from(chain.len()) else {
                raise_err!(CODEC_INVALID_LENGTH, "Certificate chain of slot {slot_id} exceeds 64 KiB.");
            };
            let request = SpdmGetCertificate {
                slot_id,
                offset,
                length: CERTIFICATE_PORTION_LEN,
            };
            let response = SpdmCertificateResponse::parse(&self.exchange(&request.build())?)?;
            if response.slot_id != slot_id {
                raise_err!(
                    SPDM_COMMAND_FAILED,
                    "Certificate of slot {} returned for slot {slot_id}.",
                    response.slot_id
                );
            }
            chain.extend_from_slice(&response.portion);
            if response.remainder_length == 0 {
                break;
            }
            if response.portion.is_empty() || chain.len() + usize::from(response.remainder_length) > usize::from(u16::MAX) {
                raise_err!(
                    SPDM_COMMAND_FAILED,
                    "Certificate chain of slot {slot_id} cannot be completed."
                );
            }
        }
        self.cert_chains.insert(slot_id, chain.clone());
        Ok(chain)
    }

    fn get_measurements(&mut self, slot_id: u8) -> BkpsResult<SpdmMeasurementsResponse> {
        let request = SpdmGetMeasurements {
            nonce: rand::random(),
            slot_id,
        }
        .build();
        let response_bytes = self.exchange(&request)?;
        let response = SpdmMeasurementsResponse::parse(&response_bytes)?;

        let mut transcript = self.message_a.clone();
        transcript.extend_from_slice(&request);
        transcript.extend_from_slice(&response.build_unsigned()?);
        self.verify_responder_signature(
            slot_id,
            MEASUREMENTS_SIGNING_CONTEXT,
            &transcript,
            &response.signature,
        )?;
        Ok(response)
    }

    fn start_session(&mut self, slot_id: u8) -> BkpsResult<[u8; SPDM_HASH_LEN]> {
        let algorithms = self.algorithms()?;
        if algorithms.dhe != DHE_SECP384R1 || algorithms.aead != AEAD_AES_256_GCM {
            raise_err!(
                UNSUPPORTED_ALGORITHM,
                "Session with DHE 0x{:x} and AEAD 0x{:x} is not supported.",
                algorithms.dhe,
                algorithms.aead
            );
        }
        let (raw_chain, _) = self.cert_chain(slot_id)?;
        let mut transcript = self.message_a.clone();
        transcript.extend_from_slice(&sha384(raw_chain));

        let dh = EcdhKeyPair::generate()?;
        let req_session_id = self.next_req_session_id;
        self.next_req_session_id = self.next_req_session_id.wrapping_sub(1);
        let request = SpdmKeyExchange {
            slot_id,
            req_session_id,
            random: rand::random(),
            exchange_data: dh.public_key_raw()?,
        }
        .build();
        let response = SpdmKeyExchangeResponse::parse(&self.exchange(&request)?)?;
        transcript.extend_from_slice(&request);
        transcript.extend_from_slice(&response.build_unsigned());
        self.verify_responder_signature(
            slot_id,
            KEY_EXCHANGE_RSP_SIGNING_CONTEXT,
            &transcript,
            &response.signature,
        )?;
        transcript.extend_from_slice(&response.signature);

        let th1 = sha384(&transcript);
        let shared_secret = dh.shared_secret(&response.exchange_data)?;
        let handshake = SpdmHandshake::derive(&shared_secret, &th1)?;
        if !openssl::memcmp::eq(&handshake.responder_verify_data(&th1)?, &response.verify_data) {
            raise_err!(ATTESTATION_FAILED, "KEY_EXCHANGE_RSP verify data mismatch.");
        }
        transcript.extend_from_slice(&response.verify_data);

        let mut finish = SpdmFinish {
            req_slot_id: 0,
            signature: None,
            verify_data: [0; SPDM_HASH_LEN],
        };
        if response.mut_auth_requested != 0 {
            let Some(signer) = &self.signer else {
                raise_err!(
                    PROVISIONING_GENERIC,
                    "Responder requested mutual authentication but no requester key is configured."
                );
            };
            let mut signed: Vec<u8> = transcript.clone();
            finish.signature = Some([0; SPDM_SIGNATURE_LEN]);
            signed.extend_from_slice(&finish.header().build());
            finish.signature = Some(signer.sign(&algorithms, &signed)?);
        }
        transcript.extend_from_slice(&finish.header().build());
        if let Some(signature) = &finish.signature {
            transcript.extend_from_slice(signature);
        }
        finish.verify_data = handshake.requester_verify_data(&transcript)?;
        transcript.extend_from_slice(&finish.verify_data);

        let finish_response = self.exchange(&finish.build())?;
        SpdmHeader::expect(&finish_response, SpdmCode::FINISH_RSP)?;
        transcript.extend_from_slice(&finish_response);

        let session_id = SpdmSession::session_id(req_session_id, response.rsp_session_id);
        self.session = Some(SpdmSession::requester(session_id, &handshake, &sha384(&transcript))?);
        log::info!("SPDM session 0x{session_id:08x} established with slot {slot_id}.");
        Ok(response.measurement_summary_hash)
    }

    fn send_data(&mut self, payload: &[u8]) -> BkpsResult<Vec<u8>> {
        if self.session.is_none() {
            raise_err!(SPDM_COMMAND_FAILED, "No SPDM session established.");
        }
        let request = SpdmVendorDefined::mailbox(payload.to_vec()).build(SpdmCode::VENDOR_DEFINED_REQUEST)?;
        let response = self.exchange(&request)?;
        Ok(SpdmVendorDefined::parse(&response, SpdmCode::VENDOR_DEFINED_RESPONSE)?.payload)
    }

    fn end_session(&mut self) -> BkpsResult<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let response = self.exchange(&SpdmHeader::new(SpdmCode::END_SESSION, 0, 0).build())?;
        self.session = None;
        SpdmHeader::expect(&response, SpdmCode::END_SESSION_ACK)?;
        Ok(())
    }

    fn set_certificate(&mut self, slot_id: u8, cert_chain: &[u8]) -> BkpsResult<()> {
        let request = SpdmSetCertificate {
            slot_id,
            cert_chain: cert_chain.to_vec(),
        };
        let response = self.exchange(&request.build())?;
        let (header, _) = SpdmHeader::expect(&response, SpdmCode::SET_CERTIFICATE_RSP)?;
        if header.param1 & 0x0F != slot_id {
            raise_err!(
                SPDM_COMMAND_FAILED,
                "SET_CERTIFICATE acknowledged for slot {} instead of {slot_id}.",
                header.param1 & 0x0F
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spdm::sim::{DirectTransport, SpdmResponderSim};
    use crate::testing::TestPki;
    use bkps_api::{CommandId, CommandLayer};
    use bkps_crypto::{OpensslEnclave, SecurityEnclave, SecurityObjectType};

    fn requester(sim: SpdmResponderSim) -> (Arc<DirectTransport>, SpdmRequester) {
        let transport = Arc::new(DirectTransport::new(sim));
        let requester = SpdmRequester::new(transport.clone(), None);
        (transport, requester)
    }

    fn pki() -> TestPki {
        TestPki::new("Agilex", "22d4ef4bd6a4d748")
    }

    fn vca(requester: &mut SpdmRequester) {
        assert_eq!(requester.get_version().unwrap(), SUPPORTED_SPDM_VERSION);
        assert!(requester
            .get_capabilities()
            .unwrap()
            .contains(SpdmCapabilities::KEY_EX_CAP));
        requester.negotiate_algorithms().unwrap();
    }

    #[test]
    fn test_full_session() {
        let (transport, mut requester) = requester(SpdmResponderSim::new(pki()));
        vca(&mut requester);
        assert_eq!(requester.get_digests().unwrap(), vec![0, 1]);
        let raw = requester.get_certificate(0).unwrap();
        assert_eq!(SpdmCertChain::parse(&raw).unwrap().certificates.len(), 5);

        let measurements = requester.get_measurements(0).unwrap();
        assert_eq!(measurements.blocks().unwrap().len(), 2);
        let summary = requester.start_session(0).unwrap();
        assert_eq!(summary, sha384(&measurements.measurement_record));

        let erase = CommandLayer::create(&[], CommandId::VOLATILE_AES_ERASE);
        let response = requester.send_data(&erase).unwrap();
        assert!(CommandLayer::retrieve(&response, CommandId::VOLATILE_AES_ERASE)
            .unwrap()
            .is_empty());
        requester.end_session().unwrap();
        assert!(transport.with_sim(|sim| sim.erased && sim.session_ended));
    }

    #[test]
    fn test_large_chain_is_read_in_portions() {
        let (transport, mut requester) = requester(SpdmResponderSim::new(pki()));
        vca(&mut requester);
        let raw = requester.get_certificate(1).unwrap();
        assert!(raw.len() > usize::from(CERTIFICATE_PORTION_LEN));
        assert!(transport.with_sim(|sim| sim.certificate_requests) >= 2);
    }

    #[test]
    fn test_unsupported_version() {
        let mut sim = SpdmResponderSim::new(pki());
        sim.versions = vec![0x10, 0x11];
        let (_, mut requester) = requester(sim);
        assert_eq!(
            requester.get_version().unwrap_err().kind(),
            ErrorKind::SPDM_UNSUPPORTED_VERSION
        );
    }

    #[test]
    fn test_legacy_device_without_mctp() {
        let transport = Arc::new(DirectTransport::unknown_command());
        let mut requester = SpdmRequester::new(transport, None);
        assert_eq!(
            requester.get_version().unwrap_err().kind(),
            ErrorKind::SPDM_NOT_SUPPORTED
        );
    }

    #[test]
    fn test_tampered_measurement_signature() {
        let mut sim = SpdmResponderSim::new(pki());
        sim.corrupt_measurement_signature = true;
        let (_, mut requester) = requester(sim);
        vca(&mut requester);
        requester.get_certificate(0).unwrap();
        assert_eq!(
            requester.get_measurements(0).unwrap_err().kind(),
            ErrorKind::ATTESTATION_FAILED
        );
    }

    #[test]
    fn test_measurements_need_certificate_first() {
        let (_, mut requester) = requester(SpdmResponderSim::new(pki()));
        vca(&mut requester);
        assert_eq!(
            requester.get_measurements(0).unwrap_err().kind(),
            ErrorKind::ATTESTATION_FAILED
        );
    }

    #[test]
    fn test_key_exchange_signed_by_other_slot_key() {
        let mut sim = SpdmResponderSim::new(pki());
        sim.sign_with_slot = Some(1);
        let (_, mut requester) = requester(sim);
        vca(&mut requester);
        requester.get_certificate(0).unwrap();
        assert_eq!(
            requester.start_session(0).unwrap_err().kind(),
            ErrorKind::ATTESTATION_FAILED
        );
    }

    #[test]
    fn test_mutual_auth_signs_finish() {
        let enclave = Arc::new(OpensslEnclave::new());
        enclave.create_object("requester", SecurityObjectType::Ec384).unwrap();
        let mut sim = SpdmResponderSim::new(pki());
        sim.mutual_auth_key = Some(enclave.public_key("requester").unwrap());
        let transport = Arc::new(DirectTransport::new(sim));
        let signer = Arc::new(FinishMessageSigner::new(enclave, "requester"));
        let mut requester = SpdmRequester::new(transport.clone(), Some(signer));
        vca(&mut requester);
        requester.get_certificate(0).unwrap();
        requester.start_session(0).unwrap();
        assert!(transport.with_sim(|sim| sim.finish_signature_verified));
    }

    #[test]
    fn test_mutual_auth_without_signer() {
        let mut sim = SpdmResponderSim::new(pki());
        sim.mutual_auth_key = Some(Vec::new());
        let (_, mut requester) = requester(sim);
        vca(&mut requester);
        requester.get_certificate(0).unwrap();
        assert_eq!(
            requester.start_session(0).unwrap_err().kind(),
            ErrorKind::PROVISIONING_GENERIC
        );
    }

    #[test]
    fn test_send_data_requires_session() {
        let (_, mut requester) = requester(SpdmResponderSim::new(pki()));
        assert_eq!(
            requester.send_data(&[0; 4]).unwrap_err().kind(),
            ErrorKind::SPDM_COMMAND_FAILED
        );
    }

    #[test]
    fn test_set_certificate_installs_chain() {
        let pki = pki();
        let chain = SpdmCertChain::from_leaf_first(&pki.iid_chain()).unwrap();
        let (transport, mut requester) = requester(SpdmResponderSim::new(pki));
        vca(&mut requester);
        requester.set_certificate(3, &chain.build_padded().unwrap()).unwrap();
        let installed = transport.with_sim(|sim| sim.slot_chain(3));
        assert_eq!(SpdmCertChain::parse(&installed).unwrap(), chain);
    }
}
