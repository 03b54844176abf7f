// Licensed under the Apache-2.0 license

use crate::configuration::ConfigurationLookup;
use crate::context::{ContextConverter, FlowStage, ProtocolContext, ProtocolType, ProvisioningStatus, StageOutput};
use crate::history::OverbuildCounterManager;
use crate::sigma::SigmaFlow;
use crate::spdm::{SpdmBackgroundService, SpdmThreadError};
use bkps_api::{
    CommandId, CommandLayer, GetChipIdResponse, ProgrammerMessage, ProgrammerResponse,
    ProgrammerResponseAdapter,
};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

/// One programmer round trip: the device answers to the previous messages
/// and the context returned with them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisioningRequest {
    /// Empty on the first request of a provisioning.
    #[serde(with = "hex::serde")]
    pub context: Vec<u8>,
    pub responses: Vec<ProgrammerResponse>,
    pub cfg_id: u64,
    /// `MessageType` bits the programmer handles.
    pub supported_commands: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResponse {
    pub flow_stage: FlowStage,
    pub status: ProvisioningStatus,
    #[serde(with = "hex::serde")]
    pub context: Vec<u8>,
    pub messages: Vec<ProgrammerMessage>,
}

fn generic(message: &str) -> impl FnOnce(BkpsError) -> BkpsError + '_ {
    move |e| BkpsError::new(ErrorKind::PROVISIONING_GENERIC, message).with_source(e)
}

/// Entry point of device provisioning.
///
/// A new provisioning first probes the device with SPDM VCA. Devices that
/// complete it are provisioned over an SPDM secure session run by the
/// background service, every other device falls back to SIGMA.
pub struct ProvisioningService {
    converter: ContextConverter,
    spdm: Arc<SpdmBackgroundService>,
    sigma: SigmaFlow,
    configurations: Arc<dyn ConfigurationLookup>,
    overbuild: OverbuildCounterManager,
}

impl ProvisioningService {
    pub fn new(
        converter: ContextConverter,
        spdm: Arc<SpdmBackgroundService>,
        sigma: SigmaFlow,
        configurations: Arc<dyn ConfigurationLookup>,
        overbuild: OverbuildCounterManager,
    ) -> Self {
        Self {
            converter,
            spdm,
            sigma,
            configurations,
            overbuild,
        }
    }

    pub fn provision(&self, request: &ProvisioningRequest) -> BkpsResult<ProvisioningResponse> {
        if request.context.is_empty() {
            return self.create(request);
        }
        let mut context = self.converter.decrypt(&request.context)?;
        let output = match context.protocol_type {
            None => self.protocol_decision(&mut context, request)?,
            Some(ProtocolType::Sigma) => {
                self.sigma
                    .handle(&mut context, &request.responses, request.supported_commands)?
            }
            Some(ProtocolType::Spdm) => self.spdm_stage(&mut context, request)?,
        };
        self.respond(&context, output)
    }

    fn respond(&self, context: &ProtocolContext, output: StageOutput) -> BkpsResult<ProvisioningResponse> {
        Ok(ProvisioningResponse {
            flow_stage: context.flow_stage,
            status: output.status,
            context: self.converter.encrypt(context)?,
            messages: output.messages,
        })
    }

    fn create(&self, request: &ProvisioningRequest) -> BkpsResult<ProvisioningResponse> {
        log::info!("Creating provisioning session for configuration {}.", request.cfg_id);
        self.spdm.ensure_process_is_not_running()?;
        self.spdm.start_vca_for_secure_session()?;
        let message = self
            .spdm
            .try_get_message_from_queue()
            .map_err(generic("No response from SPDM Service."))?;
        let Some(message) = message else {
            raise_err!(PROVISIONING_GENERIC, "No response from SPDM Service.");
        };
        let mut context = ProtocolContext::new(FlowStage::ProtocolDecision);
        context.cfg_id = Some(request.cfg_id);
        self.respond(&context, StageOutput::proceed(vec![ProgrammerMessage::send_packet(message)]))
    }

    /// Relays one device response to the running SPDM task. Returns the
    /// next command of the task, or None once it finished.
    fn relay(&self, request: &ProvisioningRequest) -> BkpsResult<Option<ProgrammerMessage>> {
        let mut adapter = ProgrammerResponseAdapter::expecting(&request.responses, 1)?;
        if !self.spdm.is_processing() {
            raise_err!(PROVISIONING_GENERIC, "SPDM Service is not working.");
        }
        self.spdm.push_response(adapter.next_response()?.to_vec())?;
        let message = self
            .spdm
            .try_get_message_from_queue()
            .map_err(generic("SPDM Service failed to complete gracefully."))?;
        Ok(message.map(ProgrammerMessage::send_packet))
    }

    fn process_result(&self) -> BkpsResult<SpdmThreadError> {
        let result = self.spdm.get_process_result()?.unwrap_or(SpdmThreadError::Failure);
        log::debug!("SPDM Service - process result: {result:?}");
        Ok(result)
    }

    fn protocol_decision(
        &self,
        context: &mut ProtocolContext,
        request: &ProvisioningRequest,
    ) -> BkpsResult<StageOutput> {
        if context.flow_stage != FlowStage::ProtocolDecision {
            raise_err!(PROVISIONING_GENERIC, "ProtocolType could not be determined.");
        }
        if let Some(message) = self.relay(request)? {
            return Ok(StageOutput::proceed(vec![message]));
        }
        match self.process_result()? {
            SpdmThreadError::Success => {
                log::info!("Device supports SPDM secure session, provisioning with SPDM.");
                context.protocol_type = Some(ProtocolType::Spdm);
                context.flow_stage = FlowStage::SpdmGetChipId;
                Ok(StageOutput::proceed(vec![ProgrammerMessage::send_packet(
                    CommandLayer::create(&[], CommandId::GET_CHIPID),
                )]))
            }
            result => {
                log::info!("SPDM VCA ended with {result:?}, provisioning with SIGMA.");
                context.protocol_type = Some(ProtocolType::Sigma);
                self.sigma.handle(context, &[], request.supported_commands)
            }
        }
    }

    fn spdm_stage(&self, context: &mut ProtocolContext, request: &ProvisioningRequest) -> BkpsResult<StageOutput> {
        match context.flow_stage {
            FlowStage::SpdmGetChipId => self.spdm_create(context, request),
            FlowStage::SpdmSession => self.spdm_communication(context, request),
            stage => raise_err!(
                PROVISIONING_GENERIC,
                "Flow stage {stage:?} is not part of SPDM provisioning."
            ),
        }
    }

    fn spdm_create(&self, context: &mut ProtocolContext, request: &ProvisioningRequest) -> BkpsResult<StageOutput> {
        self.spdm.ensure_process_is_not_running()?;
        let mut adapter = ProgrammerResponseAdapter::expecting(&request.responses, 1)?;
        let chip_id = GetChipIdResponse::parse(CommandLayer::retrieve(
            adapter.next_response()?,
            CommandId::GET_CHIPID,
        )?)?;
        let device_id = chip_id.device_id();
        log::info!("Provisioning device {device_id} with SPDM.");

        let Some(cfg_id) = context.cfg_id else {
            raise_err!(PROVISIONING_GENERIC, "Configuration id is missing in provisioning context.");
        };
        log::info!("Fetch configuration data for cfg id: {cfg_id}");
        let configuration = self.configurations.get_configuration(cfg_id)?;
        self.overbuild.verify(&configuration, &device_id)?;

        self.spdm.start_secure_session(device_id.clone(), cfg_id)?;
        let message = self
            .spdm
            .try_get_message_from_queue()
            .map_err(generic("No response from SPDM Service."))?;
        let Some(message) = message else {
            raise_err!(PROVISIONING_GENERIC, "No response from SPDM Service.");
        };
        context.device_id = Some(device_id);
        context.flow_stage = FlowStage::SpdmSession;
        Ok(StageOutput::proceed(vec![ProgrammerMessage::send_packet(message)]))
    }

    fn spdm_communication(
        &self,
        context: &mut ProtocolContext,
        request: &ProvisioningRequest,
    ) -> BkpsResult<StageOutput> {
        if let Some(message) = self.relay(request)? {
            return Ok(StageOutput::proceed(vec![message]));
        }
        let result = self.process_result()?;
        if result != SpdmThreadError::Success {
            raise_err!(PROVISIONING_GENERIC, "SPDM Process failed with status: {result:?}");
        }
        log::info!("Device {} provisioned over SPDM.", context.device_id()?);
        context.flow_stage = FlowStage::Done;
        Ok(StageOutput::done())
    }
}
