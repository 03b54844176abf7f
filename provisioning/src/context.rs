// Licensed under the Apache-2.0 license

use bkps_api::ProgrammerMessage;
use bkps_crypto::EncryptionProvider;
use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStage {
    ProtocolDecision,
    Create,
    Init,
    SigmaAuthData,
    SigmaEncAsset,
    Provision,
    SpdmGetChipId,
    SpdmSession,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    Continue,
    Done,
}

/// Messages produced by one stage handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub status: ProvisioningStatus,
    pub messages: Vec<ProgrammerMessage>,
}

impl StageOutput {
    pub fn proceed(messages: Vec<ProgrammerMessage>) -> Self {
        Self {
            status: ProvisioningStatus::Continue,
            messages,
        }
    }

    pub fn done() -> Self {
        Self {
            status: ProvisioningStatus::Done,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolType {
    Sigma,
    Spdm,
}

/// How the device identity is attested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttestationFamily {
    /// Single attestation certificate published on the distribution point.
    S10,
    /// DICE layered chain partially returned by the device.
    Dice,
}

/// SIGMA session state. Key material is wiped when the context is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SigmaSession {
    #[serde(default, with = "hex::serde")]
    pub bkps_dh_private_key: Vec<u8>,
    #[serde(default, with = "hex::serde")]
    pub bkps_dh_public_key: Vec<u8>,
    #[serde(default, with = "hex::serde")]
    pub device_dh_public_key: Vec<u8>,
    /// Protocol MAC key.
    #[serde(default, with = "hex::serde")]
    pub pmk: Vec<u8>,
    /// Session encryption key.
    #[serde(default, with = "hex::serde")]
    pub sek: Vec<u8>,
    /// Session MAC key.
    #[serde(default, with = "hex::serde")]
    pub smk: Vec<u8>,
    #[serde(default, with = "hex::serde")]
    pub initial_iv: Vec<u8>,
    #[serde(default)]
    pub sdm_session_id: u32,
    #[serde(default)]
    pub message_response_counter: u32,
}

/// State carried between provisioning round trips. The caller only ever
/// sees it encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolContext {
    pub flow_stage: FlowStage,
    #[serde(default)]
    pub protocol_type: Option<ProtocolType>,
    #[serde(default)]
    pub cfg_id: Option<u64>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub attestation_family: Option<AttestationFamily>,
    #[serde(default, with = "hex::serde")]
    pub device_id_enrollment_cert: Vec<u8>,
    /// BBRAM only: the key erase went out, the certificate did not yet.
    #[serde(default)]
    pub volatile_erase_sent: bool,
    #[serde(default)]
    pub sigma: SigmaSession,
}

impl ProtocolContext {
    pub fn new(flow_stage: FlowStage) -> Self {
        Self {
            flow_stage,
            protocol_type: None,
            cfg_id: None,
            device_id: None,
            attestation_family: None,
            device_id_enrollment_cert: Vec::new(),
            volatile_erase_sent: false,
            sigma: SigmaSession::default(),
        }
    }

    pub fn with_protocol(mut self, protocol_type: ProtocolType) -> Self {
        self.protocol_type = Some(protocol_type);
        self
    }

    pub fn device_id(&self) -> BkpsResult<&str> {
        self.device_id.as_deref().ok_or_else(|| {
            BkpsError::new(
                ErrorKind::PROVISIONING_GENERIC,
                "Device id is missing in provisioning context.",
            )
        })
    }
}

/// Serializes the context and encrypts it under the context key.
#[derive(Clone)]
pub struct ContextConverter {
    provider: Arc<dyn EncryptionProvider + Send + Sync>,
}

impl ContextConverter {
    pub fn new(provider: Arc<dyn EncryptionProvider + Send + Sync>) -> Self {
        Self { provider }
    }

    pub fn encrypt(&self, context: &ProtocolContext) -> BkpsResult<Vec<u8>> {
        let serialized = serde_json::to_vec(context).map_err(|e| {
            BkpsError::new(
                ErrorKind::CONTEXT_SERIALIZATION_FAILED,
                "Failed to serialize Provisioning Context.",
            )
            .with_source(e)
        })?;
        self.provider.encrypt(&serialized).map_err(|e| {
            BkpsError::new(ErrorKind::CONTEXT_ENCRYPTION_FAILED, "Preparing response failed.")
                .with_source(e)
        })
    }

    pub fn decrypt(&self, encrypted: &[u8]) -> BkpsResult<ProtocolContext> {
        let serialized = self.provider.decrypt(encrypted).map_err(|e| {
            BkpsError::new(
                ErrorKind::CONTEXT_DECRYPTION_FAILED,
                "Failed to decrypt Provisioning Context.",
            )
            .with_source(e)
        })?;
        serde_json::from_slice(&serialized).map_err(|e| {
            BkpsError::new(
                ErrorKind::CONTEXT_SERIALIZATION_FAILED,
                "Failed to deserialize Provisioning Context.",
            )
            .with_source(e)
        })
    }
}
