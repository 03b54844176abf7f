// Licensed under the Apache-2.0 license

use super::attestation::attest_and_start_session;
use super::chain::SpdmChainSearcher;
use super::protocol::{SpdmProtocol, SpdmRequester};
use super::signer::FinishMessageSigner;
use super::transport::{SpdmMessageSender, SpdmTransport};
use crate::config::SpdmConfig;
use crate::configuration::{ConfigurationLookup, StorageType};
use crate::history::OverbuildCounterManager;
use crate::sealing::SealingKeyManager;
use bkps_api::spdm::SpdmCapabilities;
use bkps_api::{CertificateResponse, CommandId, CommandLayer};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of a background SPDM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpdmThreadError {
    Success,
    Failure,
    /// The device could not prove its identity.
    AttestationFailed,
    /// The responder lacks a capability the task needs.
    UnsupportedCap,
}

impl SpdmThreadError {
    pub fn from_result(result: &BkpsResult<()>) -> Self {
        let Err(e) = result else {
            return Self::Success;
        };
        if e.is(ErrorKind::ATTESTATION_FAILED) || e.is(ErrorKind::DEVICE_CHAIN_VERIFICATION_FAILED) {
            Self::AttestationFailed
        } else if e.is(ErrorKind::CAPABILITY_UNSUPPORTED) {
            Self::UnsupportedCap
        } else {
            Self::Failure
        }
    }
}

/// Single result slot shared by all tasks. Reading it clears it.
#[derive(Debug, Default)]
pub struct ProcessResultHolder {
    result: Mutex<Option<SpdmThreadError>>,
}

impl ProcessResultHolder {
    pub fn set(&self, result: SpdmThreadError) -> BkpsResult<()> {
        *self.lock()? = Some(result);
        Ok(())
    }

    pub fn take(&self) -> BkpsResult<Option<SpdmThreadError>> {
        Ok(self.lock()?.take())
    }

    fn lock(&self) -> BkpsResult<std::sync::MutexGuard<'_, Option<SpdmThreadError>>> {
        self.result
            .lock()
            .map_err(|_| BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "SPDM result holder is poisoned."))
    }
}

/// Publishes the task outcome and clears the processing flag when dropped.
/// A task that unwinds before reporting is recorded as a failure.
struct TaskGuard {
    result: Arc<ProcessResultHolder>,
    processing: Arc<AtomicBool>,
    outcome: Option<SpdmThreadError>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(SpdmThreadError::Failure);
        if let Err(e) = self.result.set(outcome) {
            log::error!("{e}");
        }
        self.processing.store(false, Ordering::SeqCst);
    }
}

/// The SPDM tasks, each driving one requester from start to end.
pub struct SpdmActions {
    chain_searcher: SpdmChainSearcher,
    configurations: Arc<dyn ConfigurationLookup>,
    sealing: SealingKeyManager,
    overbuild: OverbuildCounterManager,
}

impl SpdmActions {
    pub fn new(
        chain_searcher: SpdmChainSearcher,
        configurations: Arc<dyn ConfigurationLookup>,
        sealing: SealingKeyManager,
        overbuild: OverbuildCounterManager,
    ) -> Self {
        Self {
            chain_searcher,
            configurations,
            sealing,
            overbuild,
        }
    }

    pub fn get_version(&self, protocol: &mut dyn SpdmProtocol) -> BkpsResult<String> {
        let version = protocol.get_version()?;
        log::info!("SPDM version: {version}");
        Ok(version)
    }

    fn vca(&self, protocol: &mut dyn SpdmProtocol) -> BkpsResult<SpdmCapabilities> {
        self.get_version(protocol)?;
        let capabilities = protocol.get_capabilities()?;
        protocol.negotiate_algorithms()?;
        Ok(capabilities)
    }

    /// Installs `cert_chain` (SPDM chain payload) into `slot_id`.
    pub fn set_authority(&self, protocol: &mut dyn SpdmProtocol, cert_chain: &[u8], slot_id: u8) -> BkpsResult<()> {
        let capabilities = self.vca(protocol)?;
        if !capabilities.contains(SpdmCapabilities::SET_CERT_CAP) {
            raise_err!(CAPABILITY_UNSUPPORTED, "SPDM Responder does not support SET_CERTIFICATE.");
        }
        log::info!("Setting certificate chain in slot {slot_id}...");
        protocol.set_certificate(slot_id, cert_chain)
    }

    pub fn vca_for_secure_session(&self, protocol: &mut dyn SpdmProtocol) -> BkpsResult<()> {
        let capabilities = self.vca(protocol)?;
        if !capabilities.contains(SpdmCapabilities::KEY_EX_CAP) {
            raise_err!(
                CAPABILITY_UNSUPPORTED,
                "SPDM Responder does not support KEY_EXCHANGE, secure session is not possible."
            );
        }
        Ok(())
    }

    /// Attests the device, opens a session and sends the AES key
    /// certificate through it.
    pub fn secure_session(&self, protocol: &mut dyn SpdmProtocol, device_id: &str, cfg_id: u64) -> BkpsResult<()> {
        self.vca_for_secure_session(protocol)?;
        let configuration = self.configurations.get_configuration(cfg_id)?;
        let chains = self.chain_searcher.search(protocol, device_id, &configuration)?;
        attest_and_start_session(protocol, &chains)?;

        if configuration.storage_type() == StorageType::Bbram {
            log::info!("Sending VOLATILE_AES_ERASE (clear BBRAM)...");
            let response = protocol.send_data(&CommandLayer::create(&[], CommandId::VOLATILE_AES_ERASE))?;
            if !CommandLayer::retrieve(&response, CommandId::VOLATILE_AES_ERASE)?.is_empty() {
                raise_err!(
                    PROVISIONING_GENERIC,
                    "VOLATILE_AES_ERASE (clear BBRAM) response is invalid."
                );
            }
        }

        let certificate = self.sealing.certificate_command(&configuration)?;
        log::info!("Sending AES key certificate to device {device_id}...");
        let response = protocol.send_data(&certificate)?;
        let response = CertificateResponse::parse(CommandLayer::retrieve(&response, CommandId::CERTIFICATE)?)?;
        if !response.process_completed() {
            raise_err!(
                PROVISIONING_GENERIC,
                "Device did not complete the CERTIFICATE command, status: 0x{:x}.",
                response.status
            );
        }
        self.overbuild
            .increment_if_first_provisioning(self.configurations.as_ref(), &configuration, device_id)
            .map_err(|e| {
                BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "Failed to increment overbuild counter")
                    .with_source(e)
            })?;
        protocol.end_session()?;
        log::info!("SPDM provisioning of device {device_id} completed.");
        Ok(())
    }
}

/// Runs SPDM tasks on a worker thread while provisioning requests shuttle
/// its mailbox messages to the device and back.
pub struct SpdmBackgroundService {
    sender: Arc<SpdmMessageSender>,
    actions: Arc<SpdmActions>,
    signer: Option<Arc<FinishMessageSigner>>,
    result: Arc<ProcessResultHolder>,
    processing: Arc<AtomicBool>,
    retry_count: u32,
    retry_delay: Duration,
}

impl SpdmBackgroundService {
    pub fn new(config: &SpdmConfig, actions: SpdmActions, signer: Option<Arc<FinishMessageSigner>>) -> Self {
        Self {
            sender: Arc::new(SpdmMessageSender::new(config)),
            actions: Arc::new(actions),
            signer,
            result: Arc::new(ProcessResultHolder::default()),
            processing: Arc::new(AtomicBool::new(false)),
            retry_count: config.retry_count,
            retry_delay: config.retry_delay(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn ensure_process_is_not_running(&self) -> BkpsResult<()> {
        if self.is_processing() {
            raise_err!(SPDM_PROCESS_STILL_RUNNING, "SPDM process is still running.");
        }
        Ok(())
    }

    pub fn start_get_version(&self) -> BkpsResult<()> {
        self.start("get version", |actions, protocol| actions.get_version(protocol).map(|_| ()))
    }

    pub fn start_set_authority(&self, cert_chain: Vec<u8>, slot_id: u8) -> BkpsResult<()> {
        self.start("set authority", move |actions, protocol| {
            actions.set_authority(protocol, &cert_chain, slot_id)
        })
    }

    pub fn start_vca_for_secure_session(&self) -> BkpsResult<()> {
        self.start("VCA for secure session", |actions, protocol| {
            actions.vca_for_secure_session(protocol)
        })
    }

    pub fn start_secure_session(&self, device_id: String, cfg_id: u64) -> BkpsResult<()> {
        self.start("secure session", move |actions, protocol| {
            actions.secure_session(protocol, &device_id, cfg_id)
        })
    }

    fn start<F>(&self, name: &'static str, task: F) -> BkpsResult<()>
    where
        F: FnOnce(&SpdmActions, &mut dyn SpdmProtocol) -> BkpsResult<()> + Send + 'static,
    {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            raise_err!(SPDM_PROCESS_STILL_RUNNING, "SPDM process is still running.");
        }
        if let Err(e) = self.sender.clear().and_then(|_| self.result.take()) {
            self.processing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        let guard = TaskGuard {
            result: self.result.clone(),
            processing: self.processing.clone(),
            outcome: None,
        };

        let transport: Arc<dyn SpdmTransport> = self.sender.clone();
        let mut requester = SpdmRequester::new(transport, self.signer.clone());
        let actions = self.actions.clone();
        log::debug!("Starting SPDM {name} task.");
        let spawned = std::thread::Builder::new()
            .name(format!("spdm-{}", name.replace(' ', "-")))
            .spawn(move || {
                let mut guard = guard;
                let outcome = task(&actions, &mut requester);
                if let Err(e) = &outcome {
                    log::error!("SPDM {name} task failed: {e}");
                }
                guard.outcome = Some(SpdmThreadError::from_result(&outcome));
            });
        if let Err(e) = spawned {
            return Err(BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "SPDM Service is not working.").with_source(e));
        }
        Ok(())
    }

    /// Hands the device answer to the running task.
    pub fn push_response(&self, response: Vec<u8>) -> BkpsResult<()> {
        self.sender.push_response(response)
    }

    /// Next mailbox command of the running task, or None once the task
    /// finished without sending another one.
    pub fn try_get_message_from_queue(&self) -> BkpsResult<Option<Vec<u8>>> {
        for attempt in 1..=self.retry_count {
            if let Some(message) = self.sender.next_message(self.retry_delay)? {
                return Ok(Some(message));
            }
            if !self.is_processing() {
                return self.sender.next_message(Duration::ZERO);
            }
            log::debug!("Waiting for SPDM message, attempt {attempt} of {}.", self.retry_count);
        }
        raise_err!(SPDM_MESSAGE_QUEUE_EMPTY, "SPDM message queue is empty.")
    }

    pub fn get_process_result(&self) -> BkpsResult<Option<SpdmThreadError>> {
        self.result.take()
    }
}
