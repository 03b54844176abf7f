// Licensed under the Apache-2.0 license

use super::enc::SigmaEncCodec;
use super::identity::ServiceIdentity;
use super::keys::SessionKeys;
use super::verify::{
    verify_all, SigmaEncResponseCounterIvVerifier, SigmaM2BkpsPubKeyVerifier,
    SigmaM2IntegrityVerifier, SigmaM2SignatureVerifier, SigmaM2WithServiceCfgVerifier,
    SigmaVerifier,
};
use crate::chain::{x509, CertificateChainCreator, CertificateChainDto, CertificateChainVerifier, IidFlowDetector};
use crate::configuration::{ConfigurationLookup, ServiceConfiguration, StorageType};
use crate::context::{AttestationFamily, FlowStage, ProtocolContext, StageOutput};
use crate::history::OverbuildCounterManager;
use crate::sealing::SealingKeyManager;
use bkps_api::sigma::{
    SigmaEncMessage, SigmaM1Message, SigmaM2Message, SigmaM3Message, SigmaTeardownMessage,
    SigmaTeardownResponse, SDM_SESSION_ID_ALL, SIGMA_IV_LEN,
};
use bkps_api::{
    CertificateRequestType, CertificateResponse, CommandId, CommandLayer,
    GetCertificateRequest, GetCertificateResponse, GetChipIdResponse, MessageType,
    ProgrammerMessage, ProgrammerResponse, ProgrammerResponseAdapter,
};
use bkps_crypto::{hmac_sha384, EcdhKeyPair};
use bkps_error::{raise_err, BkpsResult, ErrorKind};
use std::sync::Arc;
use zerocopy::IntoBytes;
use zeroize::Zeroize;

fn send(body: &[u8], command: CommandId) -> ProgrammerMessage {
    ProgrammerMessage::send_packet(CommandLayer::create(body, command))
}

fn get_certificate(certificate_type: CertificateRequestType) -> ProgrammerMessage {
    send(
        &GetCertificateRequest::new(certificate_type).build(),
        CommandId::GET_ATTESTATION_CERTIFICATE,
    )
}

/// SIGMA provisioning, one stage per programmer round trip:
///
/// * CREATE: chip id, teardown of stale sessions, enrollment certificate
/// * INIT: device certificates and M1
/// * SIGMA_AUTH_DATA: chain and M2 verification, M3
/// * SIGMA_ENC_ASSET: key erase (BBRAM only) and the AES key certificate
/// * PROVISION: certificate status, teardown and the wrapped key
/// * DONE: teardown acknowledgement
pub struct SigmaFlow {
    identity: ServiceIdentity,
    chain_creator: CertificateChainCreator,
    chain_verifier: CertificateChainVerifier,
    overbuild: OverbuildCounterManager,
    sealing: SealingKeyManager,
    configurations: Arc<dyn ConfigurationLookup>,
}

impl SigmaFlow {
    pub fn new(
        identity: ServiceIdentity,
        chain_creator: CertificateChainCreator,
        chain_verifier: CertificateChainVerifier,
        overbuild: OverbuildCounterManager,
        sealing: SealingKeyManager,
        configurations: Arc<dyn ConfigurationLookup>,
    ) -> Self {
        Self {
            identity,
            chain_creator,
            chain_verifier,
            overbuild,
            sealing,
            configurations,
        }
    }

    /// Consumes the responses to the previous stage's messages and moves
    /// `context` to the next stage.
    pub fn handle(
        &self,
        context: &mut ProtocolContext,
        responses: &[ProgrammerResponse],
        supported_commands: u32,
    ) -> BkpsResult<StageOutput> {
        log::debug!("Handling SIGMA stage {:?}.", context.flow_stage);
        match context.flow_stage {
            FlowStage::ProtocolDecision | FlowStage::Create => self.create(context, supported_commands),
            FlowStage::Init => self.init(context, responses),
            FlowStage::SigmaAuthData => self.auth(context, responses),
            FlowStage::SigmaEncAsset => self.enc_asset(context, responses),
            FlowStage::Provision => self.provision(context, responses, supported_commands),
            FlowStage::Done => Self::done(context, responses),
            stage => raise_err!(
                SIGMA_INVALID_FLOW_STAGE,
                "Flow stage {stage:?} is not part of SIGMA provisioning."
            ),
        }
    }

    fn configuration(&self, context: &ProtocolContext) -> BkpsResult<ServiceConfiguration> {
        let Some(cfg_id) = context.cfg_id else {
            raise_err!(PROVISIONING_GENERIC, "Configuration id is missing in provisioning context.");
        };
        self.configurations.get_configuration(cfg_id)
    }

    fn create(&self, context: &mut ProtocolContext, supported_commands: u32) -> BkpsResult<StageOutput> {
        log::info!("Preparing SIGMA CREATE commands...");
        let configuration = self.configuration(context)?;
        let required = configuration.key_wrapping_message_types();
        if !MessageType::at_least_one_is_set_in(&required, supported_commands) {
            raise_err!(
                PROGRAMMER_COMMAND_UNSUPPORTED,
                "Programmer does not support any of {required:?} required by configuration {}.",
                configuration.id
            );
        }
        context.flow_stage = FlowStage::Init;
        Ok(StageOutput::proceed(vec![
            send(&[], CommandId::GET_CHIPID),
            send(
                SigmaTeardownMessage::new(SDM_SESSION_ID_ALL).as_bytes(),
                CommandId::SIGMA_TEARDOWN,
            ),
            get_certificate(CertificateRequestType::DEVICE_ID_ENROLLMENT),
        ]))
    }

    fn init(&self, context: &mut ProtocolContext, responses: &[ProgrammerResponse]) -> BkpsResult<StageOutput> {
        let mut adapter = ProgrammerResponseAdapter::expecting(responses, 3)?;
        let chip_id = GetChipIdResponse::parse(CommandLayer::retrieve(
            adapter.next_response()?,
            CommandId::GET_CHIPID,
        )?)?;
        let device_id = chip_id.device_id();
        log::info!("Provisioning device {device_id} with SIGMA.");
        SigmaTeardownResponse::parse(CommandLayer::retrieve(
            adapter.next_response()?,
            CommandId::SIGMA_TEARDOWN,
        )?)?;
        let enrollment_cert = Self::enrollment_certificate(adapter.next_response()?)?;

        let configuration = self.configuration(context)?;
        self.overbuild.verify(&configuration, &device_id)?;

        let mut messages = Vec::new();
        match enrollment_cert {
            Some(enrollment_cert) => {
                self.chain_creator.prefetch_dice(&device_id, &enrollment_cert)?;
                messages.push(get_certificate(CertificateRequestType::UDS_EFUSE_BKP));
                messages.push(get_certificate(CertificateRequestType::FIRMWARE));
                if Self::requests_iid_uds(&configuration, &enrollment_cert) {
                    messages.push(get_certificate(CertificateRequestType::UDS_IID_PUF_BKP));
                }
                context.attestation_family = Some(AttestationFamily::Dice);
                context.device_id_enrollment_cert = enrollment_cert;
            }
            None => {
                self.chain_creator.prefetch_s10(&device_id)?;
                context.attestation_family = Some(AttestationFamily::S10);
            }
        }

        let dh = EcdhKeyPair::generate()?;
        let public_key = dh.public_key_raw()?;
        context.sigma.bkps_dh_private_key = dh.private_bytes()?.to_vec();
        context.sigma.bkps_dh_public_key = public_key.to_vec();
        messages.push(send(
            &SigmaM1Message::new(public_key).build(&self.identity.chain_bytes()),
            CommandId::SIGMA_M1,
        ));

        context.device_id = Some(device_id);
        context.flow_stage = FlowStage::SigmaAuthData;
        Ok(StageOutput::proceed(messages))
    }

    /// None when the device family has no enrollment certificate.
    fn enrollment_certificate(response: &[u8]) -> BkpsResult<Option<Vec<u8>>> {
        let body = match CommandLayer::retrieve(response, CommandId::GET_ATTESTATION_CERTIFICATE) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::UNKNOWN_COMMAND_RESPONSE => {
                log::info!("Device does not provide enrollment certificate, using S10 attestation.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let response = GetCertificateResponse::parse(body)?;
        if response.certificate_type != CertificateRequestType::DEVICE_ID_ENROLLMENT {
            raise_err!(
                CERTIFICATE_REQUEST_TYPE_MISMATCH,
                "Certificate type mismatch. Expected: {}, actual: {}.",
                CertificateRequestType::DEVICE_ID_ENROLLMENT.name(),
                response.certificate_type.name()
            );
        }
        Ok(Some(x509::leading_certificate(&response.certificate_blob)?))
    }

    fn requests_iid_uds(configuration: &ServiceConfiguration, enrollment_cert: &[u8]) -> bool {
        IidFlowDetector::with_require_iid_uds(configuration.require_iid_uds).is_iid_flow(enrollment_cert)
    }

    fn device_chain(
        &self,
        context: &ProtocolContext,
        configuration: &ServiceConfiguration,
        adapter: &mut ProgrammerResponseAdapter,
    ) -> BkpsResult<CertificateChainDto> {
        let device_id = context.device_id()?;
        match context.attestation_family {
            Some(AttestationFamily::Dice) => {
                let enrollment_cert = &context.device_id_enrollment_cert;
                let chain = self.chain_creator.create_dice_chain(
                    adapter,
                    device_id,
                    enrollment_cert,
                    Self::requests_iid_uds(configuration, enrollment_cert),
                )?;
                self.chain_verifier.verify_dice_chain(
                    device_id,
                    &chain,
                    configuration.require_iid_uds,
                    configuration.test_mode_secrets,
                )?;
                Ok(chain)
            }
            Some(AttestationFamily::S10) => {
                let chain = self.chain_creator.create_s10_chain(device_id)?;
                self.chain_verifier.verify_s10_chain(device_id, &chain)?;
                Ok(chain)
            }
            None => raise_err!(
                SIGMA_INVALID_FLOW_STAGE,
                "Attestation family is missing in provisioning context."
            ),
        }
    }

    fn auth(&self, context: &mut ProtocolContext, responses: &[ProgrammerResponse]) -> BkpsResult<StageOutput> {
        let configuration = self.configuration(context)?;
        let expected = match context.attestation_family {
            Some(AttestationFamily::Dice)
                if Self::requests_iid_uds(&configuration, &context.device_id_enrollment_cert) =>
            {
                4
            }
            Some(AttestationFamily::Dice) => 3,
            _ => 1,
        };
        let mut adapter = ProgrammerResponseAdapter::expecting(responses, expected)?;
        let chain = self.device_chain(context, &configuration, &mut adapter)?;
        let Some(leaf) = chain.certificates.first() else {
            raise_err!(
                DEVICE_CHAIN_VERIFICATION_FAILED,
                "Device attestation certificate is missing."
            );
        };

        let m2 = SigmaM2Message::parse(CommandLayer::retrieve(
            adapter.next_response()?,
            CommandId::SIGMA_M1,
        )?)?;
        let dh = EcdhKeyPair::from_private_bytes(&context.sigma.bkps_dh_private_key)?;
        let keys = SessionKeys::derive(&dh, &m2.device_dh_pub_key)?;

        log::info!("Verifying SIGMA M2 message...");
        verify_all(&[
            &SigmaM2IntegrityVerifier {
                pmk: &keys.pmk,
                message: &m2,
            },
            &SigmaM2SignatureVerifier {
                device_leaf_cert: leaf,
                message: &m2,
            },
            &SigmaM2BkpsPubKeyVerifier {
                expected: &context.sigma.bkps_dh_public_key,
                message: &m2,
            },
            &SigmaM2WithServiceCfgVerifier {
                configuration: &configuration,
                message: &m2,
            },
        ])?;

        let mut m3 = SigmaM3Message::new(m2.sdm_session_id, m2.bkps_dh_pub_key, m2.device_dh_pub_key);
        m3.signature = self.identity.sign_raw(m3.signed_data())?;
        m3.mac = hmac_sha384(&keys.pmk, m3.mac_data())?;

        let initial_iv: [u8; SIGMA_IV_LEN] = rand::random();
        let session = &mut context.sigma;
        session.device_dh_public_key = m2.device_dh_pub_key.to_vec();
        session.pmk = keys.pmk.to_vec();
        session.sek = keys.sek.to_vec();
        session.smk = keys.smk.to_vec();
        session.initial_iv = initial_iv.to_vec();
        session.sdm_session_id = m2.sdm_session_id;
        session.message_response_counter = 1;

        context.flow_stage = FlowStage::SigmaEncAsset;
        Ok(StageOutput::proceed(vec![send(m3.as_bytes(), CommandId::SIGMA_M3)]))
    }

    fn enc_asset(&self, context: &mut ProtocolContext, responses: &[ProgrammerResponse]) -> BkpsResult<StageOutput> {
        let mut adapter = ProgrammerResponseAdapter::expecting(responses, 1)?;
        let configuration = self.configuration(context)?;
        if context.volatile_erase_sent {
            let value = Self::open_response(context, adapter.next_response()?)?;
            Self::verify_erase_response(&value)?;
        } else {
            CommandLayer::retrieve(adapter.next_response()?, CommandId::SIGMA_M3)?;
            if configuration.storage_type() == StorageType::Bbram {
                log::info!("Erasing volatile AES key before BBRAM provisioning.");
                let erase = Self::seal_request(context, CommandLayer::create(&[], CommandId::VOLATILE_AES_ERASE))?;
                context.volatile_erase_sent = true;
                return Ok(StageOutput::proceed(vec![erase]));
            }
        }
        let certificate = Self::seal_request(context, self.sealing.certificate_command(&configuration)?)?;
        context.flow_stage = FlowStage::Provision;
        Ok(StageOutput::proceed(vec![certificate]))
    }

    /// A header only response acknowledges the erase as well.
    fn verify_erase_response(value: &[u8]) -> BkpsResult<()> {
        if value.is_empty() {
            return Ok(());
        }
        let body = CommandLayer::retrieve(value, CommandId::VOLATILE_AES_ERASE)?;
        if !body.is_empty() {
            raise_err!(
                PROVISIONING_GENERIC,
                "VOLATILE_AES_ERASE response should be empty but is {} bytes.",
                body.len()
            );
        }
        Ok(())
    }

    fn codec(context: &ProtocolContext) -> SigmaEncCodec<'_> {
        SigmaEncCodec {
            sdm_session_id: context.sigma.sdm_session_id,
            sek: &context.sigma.sek,
            smk: &context.sigma.smk,
            initial_iv: &context.sigma.initial_iv,
        }
    }

    fn seal_request(context: &ProtocolContext, value: Vec<u8>) -> BkpsResult<ProgrammerMessage> {
        let message = Self::codec(context).seal(context.sigma.message_response_counter, value)?;
        Ok(send(&message.build(), CommandId::SIGMA_ENC))
    }

    /// Authenticates and decrypts a SIGMA_ENC response. The response must
    /// carry the request counter plus one; the next request skips past it.
    fn open_response(context: &mut ProtocolContext, response: &[u8]) -> BkpsResult<Vec<u8>> {
        let message = SigmaEncMessage::parse(CommandLayer::retrieve(response, CommandId::SIGMA_ENC)?)?;
        let value = Self::codec(context).open(&message)?;
        SigmaEncResponseCounterIvVerifier {
            expected_counter: context.sigma.message_response_counter + 1,
            initial_iv: &context.sigma.initial_iv,
            message: &message,
        }
        .verify()?;
        context.sigma.message_response_counter += 2;
        Ok(value)
    }

    fn provision(
        &self,
        context: &mut ProtocolContext,
        responses: &[ProgrammerResponse],
        supported_commands: u32,
    ) -> BkpsResult<StageOutput> {
        let mut adapter = ProgrammerResponseAdapter::expecting(responses, 1)?;
        let value = Self::open_response(context, adapter.next_response()?)?;
        let configuration = self.configuration(context)?;
        let device_id = context.device_id()?.to_string();

        let wrapped_key = if value.is_empty() {
            log::warn!("SIGMA_ENC response does not carry CERTIFICATE status.");
            Vec::new()
        } else {
            let response = CertificateResponse::parse(CommandLayer::retrieve(&value, CommandId::CERTIFICATE)?)?;
            if !response.process_completed() {
                raise_err!(
                    PROVISIONING_GENERIC,
                    "Device failed to process AES key certificate. Status: 0x{:x}.",
                    response.status
                );
            }
            response.response_data
        };
        self.overbuild
            .increment_if_first_provisioning(self.configurations.as_ref(), &configuration, &device_id)?;

        let mut messages = vec![send(
            SigmaTeardownMessage::new(context.sigma.sdm_session_id).as_bytes(),
            CommandId::SIGMA_TEARDOWN,
        )];
        if let Some(message_type) = configuration.wrapped_key_message_type(supported_commands) {
            if wrapped_key.is_empty() {
                raise_err!(PROVISIONING_GENERIC, "Device did not return the wrapped key.");
            }
            log::info!("Returning wrapped key to programmer as {message_type:?}.");
            messages.push(ProgrammerMessage::new(message_type, wrapped_key));
        }
        log::info!("Device {device_id} provisioned, closing SIGMA session.");
        context.flow_stage = FlowStage::Done;
        Ok(StageOutput::proceed(messages))
    }

    fn done(context: &mut ProtocolContext, responses: &[ProgrammerResponse]) -> BkpsResult<StageOutput> {
        let mut adapter = ProgrammerResponseAdapter::expecting(responses, 1)?;
        SigmaTeardownResponse::parse(CommandLayer::retrieve(
            adapter.next_response()?,
            CommandId::SIGMA_TEARDOWN,
        )?)?;
        context.sigma.zeroize();
        Ok(StageOutput::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryDistributionPoint;
    use crate::config::DistributionPointConfig;
    use crate::configuration::{InMemoryConfigurations, KeyWrappingType};
    use crate::context::{ProtocolType, ProvisioningStatus};
    use crate::history::ProvisioningHistory;
    use crate::sealing::InMemorySealingKeyStore;
    use crate::sigma::identity::test_identity;
    use crate::testing::{DeviceIdentity, S10TestPki, SigmaDeviceSim, TestPki};
    use bkps_crypto::{sha256, EncryptionProvider, OpensslEnclave};
    use bkps_error::BkpsError;

    const ALL_COMMANDS: u32 = 0x3F;
    const AES_KEY_CERTIFICATE: [u8; 32] = [0xA5; 32];
    const DEVICE_ID: &str = "22d4ef4bd6a4d748";

    struct Fixture {
        flow: SigmaFlow,
        configurations: Arc<InMemoryConfigurations>,
        device: SigmaDeviceSim,
        cfg_id: u64,
    }

    fn fixture(identity: DeviceIdentity, mut configuration: ServiceConfiguration) -> Fixture {
        let enclave = Arc::new(OpensslEnclave::new());
        let dp = Arc::new(InMemoryDistributionPoint::new());
        for (url, bytes) in identity.dp_files() {
            dp.publish(url, bytes);
        }
        let dp_config = DistributionPointConfig {
            main_path: "http://dp.test".into(),
            trusted_root_hash: vec![hex::encode_upper(sha256(identity.root()))],
            ..Default::default()
        };
        let sealing = SealingKeyManager::new(enclave.clone(), Arc::new(InMemorySealingKeyStore::new()));
        sealing.create_active_key().unwrap();
        let sealed = sealing.active_provider().unwrap().encrypt(&AES_KEY_CERTIFICATE).unwrap();
        configuration.confidential_data.aes_key.value = hex::encode(sealed);
        let configurations = Arc::new(InMemoryConfigurations::new());
        let cfg_id = configurations.save(configuration).unwrap();

        let flow = SigmaFlow::new(
            test_identity(enclave.clone()),
            CertificateChainCreator::new(&dp_config, dp),
            CertificateChainVerifier::new(dp_config.trusted_root_hash.clone()),
            OverbuildCounterManager::new(Arc::new(ProvisioningHistory::new())),
            sealing,
            configurations.clone(),
        );
        Fixture {
            flow,
            configurations,
            device: SigmaDeviceSim::new(identity),
            cfg_id,
        }
    }

    fn agilex() -> DeviceIdentity {
        DeviceIdentity::Dice(TestPki::new("Agilex", DEVICE_ID))
    }

    fn start(f: &Fixture) -> ProtocolContext {
        let mut context = ProtocolContext::new(FlowStage::ProtocolDecision).with_protocol(ProtocolType::Sigma);
        context.cfg_id = Some(f.cfg_id);
        context
    }

    /// Runs the stages expecting the given message counts, then DONE.
    fn run(f: &mut Fixture, expected: &[usize]) -> Vec<Vec<ProgrammerMessage>> {
        let mut context = start(f);
        let mut responses = Vec::new();
        let mut emitted = Vec::new();
        for count in expected {
            let output = f.flow.handle(&mut context, &responses, ALL_COMMANDS).unwrap();
            assert_eq!(output.status, ProvisioningStatus::Continue);
            assert_eq!(output.messages.len(), *count, "stage {:?}", context.flow_stage);
            responses = f.device.respond_all(&output.messages);
            emitted.push(output.messages);
        }
        let output = f.flow.handle(&mut context, &responses, ALL_COMMANDS).unwrap();
        assert_eq!(output, StageOutput::done());
        assert!(context.sigma.pmk.is_empty());
        emitted
    }

    /// Runs until the stage that fails.
    fn run_until_error(f: &mut Fixture) -> BkpsError {
        let mut context = start(f);
        let mut responses = Vec::new();
        loop {
            match f.flow.handle(&mut context, &responses, ALL_COMMANDS) {
                Ok(output) => {
                    assert_eq!(output.status, ProvisioningStatus::Continue);
                    responses = f.device.respond_all(&output.messages);
                }
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn test_agilex_efuses() {
        let configuration = ServiceConfiguration {
            require_iid_uds: false,
            ..Default::default()
        };
        let mut f = fixture(agilex(), configuration);
        run(&mut f, &[3, 3, 1, 1, 1]);
        assert_eq!(f.device.received_aes_key.as_deref(), Some(&AES_KEY_CERTIFICATE[..]));
        assert!(f.device.torn_down);
        assert!(!f.device.erased);
        let configuration = f.configurations.get_configuration(f.cfg_id).unwrap();
        assert_eq!(configuration.overbuild_current, 1);
    }

    #[test]
    fn test_agilex_with_iid_uds_and_bbram() {
        let mut configuration = ServiceConfiguration::default();
        configuration.confidential_data.storage_type = StorageType::Bbram;
        let mut f = fixture(agilex(), configuration);
        run(&mut f, &[3, 4, 1, 1, 1, 1]);
        assert!(f.device.erased);
        assert!(f.device.received_aes_key.is_some());
    }

    #[test]
    fn test_pufss_returns_wrapped_key() {
        let mut configuration = ServiceConfiguration::default();
        configuration.confidential_data.storage_type = StorageType::Pufss;
        configuration.confidential_data.key_wrapping = KeyWrappingType::UserIidPuf;
        let mut f = fixture(agilex(), configuration);
        f.device.wrapped_key = vec![0x5A; 64];

        let emitted = run(&mut f, &[3, 4, 1, 1, 2]);
        let provision = &emitted[4];
        assert_eq!(provision[0].message_type, MessageType::SendPacket);
        assert_eq!(provision[1].message_type, MessageType::PushWrappedKeyUserIid);
        assert_eq!(provision[1].value, vec![0x5A; 64]);
    }

    #[test]
    fn test_s10_skips_device_certificates() {
        let identity = DeviceIdentity::S10(S10TestPki::new(DEVICE_ID));
        let mut f = fixture(identity, ServiceConfiguration::default());
        run(&mut f, &[3, 1, 1, 1, 1]);
    }

    #[test]
    fn test_corrupted_m2_mac() {
        let mut f = fixture(agilex(), ServiceConfiguration::default());
        f.device.corrupt_m2_mac = true;
        let err = run_until_error(&mut f);
        assert_eq!(err.kind(), ErrorKind::SIGMA_INTEGRITY_VERIFICATION_FAILED);
    }

    #[test]
    fn test_corrupted_m2_signature() {
        let mut f = fixture(agilex(), ServiceConfiguration::default());
        f.device.corrupt_m2_signature = true;
        let err = run_until_error(&mut f);
        assert_eq!(err.kind(), ErrorKind::SIGMA_SIGNATURE_VERIFICATION_FAILED);
    }

    #[test]
    fn test_replayed_enc_response() {
        let mut f = fixture(agilex(), ServiceConfiguration::default());
        f.device.replay_response_counter = true;
        let err = run_until_error(&mut f);
        assert_eq!(err.kind(), ErrorKind::SIGMA_REPLAY_OR_ORDERING_VIOLATION);
        let configuration = f.configurations.get_configuration(f.cfg_id).unwrap();
        assert_eq!(configuration.overbuild_current, 0);
    }

    #[test]
    fn test_blacklisted_rom_version() {
        let mut configuration = ServiceConfiguration::default();
        configuration.attestation_config.blacklist.rom_versions.insert(1);
        let mut f = fixture(agilex(), configuration);
        let err = run_until_error(&mut f);
        assert_eq!(err.kind(), ErrorKind::SIGMA_CONFIGURATION_POLICY_VIOLATION);
    }

    #[test]
    fn test_programmer_without_wrapped_key_support() {
        let mut configuration = ServiceConfiguration::default();
        configuration.confidential_data.storage_type = StorageType::Pufss;
        let f = fixture(agilex(), configuration);
        let mut context = start(&f);
        let err = f.flow.handle(&mut context, &[], 1 << MessageType::SendPacket.bit()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PROGRAMMER_COMMAND_UNSUPPORTED);
    }

    #[test]
    fn test_overbuild_exceeded() {
        let configuration = ServiceConfiguration {
            overbuild_max: 1,
            overbuild_current: 1,
            ..Default::default()
        };
        let mut f = fixture(agilex(), configuration);
        let err = run_until_error(&mut f);
        assert_eq!(err.kind(), ErrorKind::OVERBUILD_EXCEEDED);
    }

    #[test]
    fn test_wrong_response_count() {
        let f = fixture(agilex(), ServiceConfiguration::default());
        let mut context = start(&f);
        f.flow.handle(&mut context, &[], ALL_COMMANDS).unwrap();
        let err = f.flow.handle(&mut context, &[], ALL_COMMANDS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SIGMA_RESPONSE_COUNT_MISMATCH);
    }
}
