// Licensed under the Apache-2.0 license

//! SPDM 1.2 responder behind the MCTP mailbox command, answering the way
//! device firmware does. Slot 0 holds the eFuse UDS chain, slot 1 the IID
//! UDS chain.

use super::chain::SpdmCertChain;
use super::session::{SpdmHandshake, SpdmSession};
use super::signer::{
    spdm_signing_data, FINISH_SIGNING_CONTEXT, KEY_EXCHANGE_RSP_SIGNING_CONTEXT,
    MEASUREMENTS_SIGNING_CONTEXT,
};
use super::transport::SpdmTransport;
use crate::testing::TestPki;
use bkps_api::spdm::{
    spdm_error, SpdmAlgorithms, SpdmCapabilities, SpdmCapabilitiesMessage, SpdmCertificateResponse,
    SpdmCode, SpdmDigestsResponse, SpdmErrorCode, SpdmFinish, SpdmGetCertificate,
    SpdmGetMeasurements, SpdmHeader, SpdmKeyExchange, SpdmKeyExchangeResponse,
    SpdmMeasurementBlock, SpdmMeasurementsResponse, SpdmReader, SpdmSetCertificate,
    SpdmVendorDefined, SpdmVersionResponse, SPDM_HASH_LEN,
};
use bkps_api::{
    CertificateCommand, CertificateResponse, CommandHeader, CommandId, CommandLayer, EndiannessActor,
    MctpMessage, MctpMessageType, ResponseCode,
};
use bkps_crypto::{ecdsa_sign_raw, ecdsa_verify_raw, sha384, EcdhKeyPair};
use bkps_error::BkpsResult;
use openssl::ec::EcKey;
use openssl::pkey::{PKey, Private};
use std::collections::BTreeMap;
use std::sync::Mutex;

const RSP_SESSION_ID: u16 = 0x0001;

struct PendingHandshake {
    session_id: u32,
    handshake: SpdmHandshake,
    transcript: Vec<u8>,
}

pub struct SpdmResponderSim {
    pki: TestPki,
    pub versions: Vec<u8>,
    pub capabilities: SpdmCapabilities,
    /// Answer MCTP with UNKNOWN_COMMAND like pre-SPDM firmware.
    pub mctp_supported: bool,
    pub corrupt_measurement_signature: bool,
    pub corrupt_measurement_summary: bool,
    /// Sign with the key of another slot.
    pub sign_with_slot: Option<u8>,
    /// DER public key checked against the FINISH signature. Requests
    /// mutual authentication when set.
    pub mutual_auth_key: Option<Vec<u8>>,
    /// Status of the CERTIFICATE command.
    pub certificate_status: u32,
    /// Non-empty answer to VOLATILE_AES_ERASE.
    pub erase_response: Vec<u8>,

    pub certificate_requests: usize,
    pub requested_slots: Vec<u8>,
    pub finish_signature_verified: bool,
    pub erased: bool,
    pub received_aes_key: Option<Vec<u8>>,
    pub session_ended: bool,

    slots: BTreeMap<u8, Vec<u8>>,
    keys: BTreeMap<u8, EcKey<Private>>,
    measurement_record: Vec<u8>,
    message_a: Vec<u8>,
    handshake: Option<PendingHandshake>,
    session: Option<SpdmSession>,
}

impl SpdmResponderSim {
    pub fn new(pki: TestPki) -> Self {
        let slots = BTreeMap::from([
            (0, SpdmCertChain::from_leaf_first(&pki.efuse_chain()).unwrap().build().unwrap()),
            (1, SpdmCertChain::from_leaf_first(&pki.iid_chain()).unwrap().build().unwrap()),
        ]);
        let keys = BTreeMap::from([(0, pki.efuse_leaf.ec_key()), (1, pki.iid_leaf.ec_key())]);
        let measurement_record = [
            SpdmMeasurementBlock {
                index: 1,
                value_type: 0x01,
                value: sha384(b"sdm firmware").to_vec(),
            },
            SpdmMeasurementBlock {
                index: 2,
                value_type: 0x82,
                value: b"21.3.0".to_vec(),
            },
        ]
        .iter()
        .flat_map(|block| block.build().unwrap())
        .collect();
        Self {
            pki,
            versions: vec![0x10, 0x11, 0x12],
            capabilities: SpdmCapabilities::CERT_CAP
                | SpdmCapabilities::MEAS_CAP_SIG
                | SpdmCapabilities::ENCRYPT_CAP
                | SpdmCapabilities::MAC_CAP
                | SpdmCapabilities::MUT_AUTH_CAP
                | SpdmCapabilities::KEY_EX_CAP
                | SpdmCapabilities::SET_CERT_CAP,
            mctp_supported: true,
            corrupt_measurement_signature: false,
            corrupt_measurement_summary: false,
            sign_with_slot: None,
            mutual_auth_key: None,
            certificate_status: CertificateResponse::PROCESS_COMPLETED,
            erase_response: Vec::new(),
            certificate_requests: 0,
            requested_slots: Vec::new(),
            finish_signature_verified: false,
            erased: false,
            received_aes_key: None,
            session_ended: false,
            slots,
            keys,
            measurement_record,
            message_a: Vec::new(),
            handshake: None,
            session: None,
        }
    }

    pub fn pki(&self) -> &TestPki {
        &self.pki
    }

    pub fn slot_chain(&self, slot_id: u8) -> Vec<u8> {
        self.slots.get(&slot_id).cloned().unwrap_or_default()
    }

    pub fn set_slot_chain(&mut self, slot_id: u8, chain: Vec<u8>) {
        self.slots.insert(slot_id, chain);
    }

    fn signing_key(&self, slot_id: u8) -> &EcKey<Private> {
        let slot_id = self.sign_with_slot.unwrap_or(slot_id);
        self.keys.get(&slot_id).unwrap_or(&self.keys[&0])
    }

    /// Answers a mailbox command frame.
    pub fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        let header = CommandHeader::decode(frame, EndiannessActor::Firmware).unwrap();
        let body = &frame[4..4 + header.arg_len as usize * 4];
        match CommandId(header.code.into()) {
            CommandId::GET_CHIPID => {
                CommandLayer::response(&hex::decode(&self.pki.device_id).unwrap(), ResponseCode::OK)
            }
            CommandId::MCTP if self.mctp_supported => {
                let request = MctpMessage::parse(body).unwrap();
                let response = self.mctp(request);
                CommandLayer::response(&response.build().unwrap(), ResponseCode::OK)
            }
            _ => CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND),
        }
    }

    fn mctp(&mut self, request: MctpMessage) -> MctpMessage {
        if request.message_type == MctpMessageType::SPDM {
            let response = self.spdm(&request.payload);
            return MctpMessage::new(MctpMessageType::SPDM, response);
        }
        let Some(session) = &mut self.session else {
            return MctpMessage::new(
                MctpMessageType::SPDM,
                spdm_error(SpdmErrorCode::UNEXPECTED_REQUEST, 0),
            );
        };
        let app_data = session.open(&request.payload).unwrap();
        assert_eq!(app_data[0], MctpMessageType::SPDM.0);
        let response = self.secured(&app_data[1..]);
        let mut app_data = vec![MctpMessageType::SPDM.0];
        app_data.extend_from_slice(&response);
        let Some(session) = &mut self.session else {
            unreachable!("session closed before END_SESSION_ACK");
        };
        let record = session.seal(&app_data).unwrap();
        if self.session_ended {
            self.session = None;
        }
        MctpMessage::new(MctpMessageType::SECURED_SPDM, record)
    }

    fn spdm(&mut self, request: &[u8]) -> Vec<u8> {
        let mut reader = SpdmReader::new(request, "SpdmRequest");
        let header = SpdmHeader::parse(&mut reader).unwrap();
        match header.code {
            SpdmCode::GET_VERSION => {
                self.message_a.clear();
                self.session = None;
                let response = SpdmVersionResponse {
                    versions: self.versions.clone(),
                }
                .build();
                self.record_a(request, &response)
            }
            SpdmCode::GET_CAPABILITIES => {
                let response = SpdmCapabilitiesMessage {
                    ct_exponent: 12,
                    flags: self.capabilities,
                    data_transfer_size: 4096,
                    max_message_size: 4096,
                }
                .build(SpdmCode::CAPABILITIES);
                self.record_a(request, &response)
            }
            SpdmCode::NEGOTIATE_ALGORITHMS => {
                let offered = SpdmAlgorithms::parse_request(request).unwrap();
                let selected = SpdmAlgorithms::default();
                assert_eq!(offered.base_asym_algo & selected.base_asym_algo, selected.base_asym_algo);
                let response = selected.build_response();
                self.record_a(request, &response)
            }
            SpdmCode::GET_DIGESTS => SpdmDigestsResponse {
                slot_mask: self.slots.keys().fold(0, |mask, slot| mask | 1 << slot),
                digests: self.slots.values().map(|chain| sha384(chain)).collect(),
            }
            .build(),
            SpdmCode::GET_CERTIFICATE => self.certificate(request),
            SpdmCode::GET_MEASUREMENTS => self.measurements(request),
            SpdmCode::KEY_EXCHANGE => self.key_exchange(request),
            SpdmCode::FINISH => self.finish(request),
            SpdmCode::SET_CERTIFICATE => {
                let request = SpdmSetCertificate::parse(request).unwrap();
                self.slots.insert(request.slot_id, request.cert_chain);
                SpdmHeader::new(SpdmCode::SET_CERTIFICATE_RSP, request.slot_id, 0).build()
            }
            _ => spdm_error(SpdmErrorCode::UNSUPPORTED_REQUEST, header.code.0),
        }
    }

    fn record_a(&mut self, request: &[u8], response: &[u8]) -> Vec<u8> {
        self.message_a.extend_from_slice(request);
        self.message_a.extend_from_slice(response);
        response.to_vec()
    }

    fn certificate(&mut self, request: &[u8]) -> Vec<u8> {
        let request = SpdmGetCertificate::parse(request).unwrap();
        self.certificate_requests += 1;
        if request.offset == 0 {
            self.requested_slots.push(request.slot_id);
        }
        let Some(chain) = self.slots.get(&request.slot_id) else {
            return spdm_error(SpdmErrorCode::INVALID_REQUEST, 0);
        };
        let start = usize::from(request.offset).min(chain.len());
        let end = (start + usize::from(request.length)).min(chain.len());
        SpdmCertificateResponse {
            slot_id: request.slot_id,
            portion: chain[start..end].to_vec(),
            remainder_length: u16::try_from(chain.len() - end).unwrap(),
        }
        .build()
        .unwrap()
    }

    fn measurements(&mut self, request: &[u8]) -> Vec<u8> {
        let parsed = SpdmGetMeasurements::parse(request).unwrap();
        let mut response = SpdmMeasurementsResponse {
            slot_id: parsed.slot_id,
            number_of_blocks: 2,
            measurement_record: self.measurement_record.clone(),
            nonce: rand::random(),
            opaque_data: Vec::new(),
            signature: [0; 96],
        };
        let mut transcript = self.message_a.clone();
        transcript.extend_from_slice(request);
        transcript.extend_from_slice(&response.build_unsigned().unwrap());
        let data = spdm_signing_data(MEASUREMENTS_SIGNING_CONTEXT, &transcript);
        response.signature = ecdsa_sign_raw(self.signing_key(parsed.slot_id), &data).unwrap();
        if self.corrupt_measurement_signature {
            response.signature[5] ^= 0xFF;
        }
        response.build().unwrap()
    }

    fn key_exchange(&mut self, request: &[u8]) -> Vec<u8> {
        let parsed = SpdmKeyExchange::parse(request).unwrap();
        let Some(chain) = self.slots.get(&parsed.slot_id) else {
            return spdm_error(SpdmErrorCode::INVALID_REQUEST, 0);
        };
        let mut transcript = self.message_a.clone();
        transcript.extend_from_slice(&sha384(chain));
        transcript.extend_from_slice(request);

        let dh = EcdhKeyPair::generate().unwrap();
        let mut summary = sha384(&self.measurement_record);
        if self.corrupt_measurement_summary {
            summary[0] ^= 0xFF;
        }
        let mut response = SpdmKeyExchangeResponse {
            rsp_session_id: RSP_SESSION_ID,
            mut_auth_requested: u8::from(self.mutual_auth_key.is_some()),
            req_slot_id: 0,
            random: rand::random(),
            exchange_data: dh.public_key_raw().unwrap(),
            measurement_summary_hash: summary,
            signature: [0; 96],
            verify_data: [0; SPDM_HASH_LEN],
        };
        transcript.extend_from_slice(&response.build_unsigned());
        let data = spdm_signing_data(KEY_EXCHANGE_RSP_SIGNING_CONTEXT, &transcript);
        response.signature = ecdsa_sign_raw(self.signing_key(parsed.slot_id), &data).unwrap();
        transcript.extend_from_slice(&response.signature);

        let th1 = sha384(&transcript);
        let shared_secret = dh.shared_secret(&parsed.exchange_data).unwrap();
        let handshake = SpdmHandshake::derive(&shared_secret, &th1).unwrap();
        response.verify_data = handshake.responder_verify_data(&th1).unwrap();
        transcript.extend_from_slice(&response.verify_data);
        self.handshake = Some(PendingHandshake {
            session_id: SpdmSession::session_id(parsed.req_session_id, RSP_SESSION_ID),
            handshake,
            transcript,
        });
        response.build()
    }

    fn finish(&mut self, request: &[u8]) -> Vec<u8> {
        let Some(mut pending) = self.handshake.take() else {
            return spdm_error(SpdmErrorCode::UNEXPECTED_REQUEST, 0);
        };
        let finish = SpdmFinish::parse(request).unwrap();
        pending.transcript.extend_from_slice(&finish.header().build());
        if let Some(key) = &self.mutual_auth_key {
            let Some(signature) = &finish.signature else {
                return spdm_error(SpdmErrorCode::INVALID_REQUEST, 0);
            };
            let key = PKey::public_key_from_der(key).unwrap();
            let data = spdm_signing_data(FINISH_SIGNING_CONTEXT, &pending.transcript);
            if !ecdsa_verify_raw(&key, &data, signature).unwrap() {
                return spdm_error(SpdmErrorCode::DECRYPT_ERROR, 0);
            }
            self.finish_signature_verified = true;
            pending.transcript.extend_from_slice(signature);
        }
        let expected = pending.handshake.requester_verify_data(&pending.transcript).unwrap();
        if expected != finish.verify_data {
            return spdm_error(SpdmErrorCode::DECRYPT_ERROR, 0);
        }
        pending.transcript.extend_from_slice(&finish.verify_data);
        let response = SpdmHeader::new(SpdmCode::FINISH_RSP, 0, 0).build();
        pending.transcript.extend_from_slice(&response);
        let th2 = sha384(&pending.transcript);
        self.session = Some(SpdmSession::responder(pending.session_id, &pending.handshake, &th2).unwrap());
        self.session_ended = false;
        response
    }

    fn secured(&mut self, request: &[u8]) -> Vec<u8> {
        let mut reader = SpdmReader::new(request, "SecuredRequest");
        let header = SpdmHeader::parse(&mut reader).unwrap();
        match header.code {
            SpdmCode::VENDOR_DEFINED_REQUEST => {
                let request = SpdmVendorDefined::parse(request, SpdmCode::VENDOR_DEFINED_REQUEST).unwrap();
                assert_eq!(request.vendor_id, SpdmVendorDefined::VENDOR_ID.to_vec());
                let response = self.mailbox(&request.payload);
                SpdmVendorDefined::mailbox(response)
                    .build(SpdmCode::VENDOR_DEFINED_RESPONSE)
                    .unwrap()
            }
            SpdmCode::END_SESSION => {
                self.session_ended = true;
                SpdmHeader::new(SpdmCode::END_SESSION_ACK, 0, 0).build()
            }
            _ => spdm_error(SpdmErrorCode::UNSUPPORTED_REQUEST, header.code.0),
        }
    }

    /// Mailbox commands tunnelled through the session.
    fn mailbox(&mut self, frame: &[u8]) -> Vec<u8> {
        let header = CommandHeader::decode(frame, EndiannessActor::Firmware).unwrap();
        let body = &frame[4..4 + header.arg_len as usize * 4];
        match CommandId(header.code.into()) {
            CommandId::VOLATILE_AES_ERASE => {
                self.erased = true;
                CommandLayer::response(&self.erase_response, ResponseCode::OK)
            }
            CommandId::CERTIFICATE => {
                let command = CertificateCommand::parse(body).unwrap();
                self.received_aes_key = Some(command.aes_key_certificate);
                let response = CertificateResponse::new(self.certificate_status, Vec::new());
                CommandLayer::response(&response.build(), ResponseCode::OK)
            }
            _ => CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND),
        }
    }
}

/// Transport handing requests straight to a simulator.
pub struct DirectTransport {
    sim: Mutex<Option<SpdmResponderSim>>,
    pending: Mutex<Option<Vec<u8>>>,
}

impl DirectTransport {
    pub fn new(sim: SpdmResponderSim) -> Self {
        Self {
            sim: Mutex::new(Some(sim)),
            pending: Mutex::new(None),
        }
    }

    /// Device without any MCTP support.
    pub fn unknown_command() -> Self {
        Self {
            sim: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn with_sim<R>(&self, f: impl FnOnce(&mut SpdmResponderSim) -> R) -> R {
        f(self.sim.lock().unwrap().as_mut().unwrap())
    }
}

impl SpdmTransport for DirectTransport {
    fn send_message(&self, message: MctpMessage) {
        let frame = CommandLayer::create(&message.build().unwrap(), CommandId::MCTP);
        let response = match self.sim.lock().unwrap().as_mut() {
            Some(sim) => sim.respond(&frame),
            None => CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND),
        };
        *self.pending.lock().unwrap() = Some(response);
    }

    fn receive_response(&self) -> BkpsResult<Option<MctpMessage>> {
        let response = self.pending.lock().unwrap().take().unwrap();
        match CommandLayer::retrieve(&response, CommandId::MCTP) {
            Ok(body) => Ok(Some(MctpMessage::parse(body)?)),
            Err(_) => Ok(None),
        }
    }
}
