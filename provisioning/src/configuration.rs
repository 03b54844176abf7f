// Licensed under the Apache-2.0 license

use bkps_api::MessageType;
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Overbuild limit that disables the counter check.
pub const OVERBUILD_MAX_INFINITE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PufType {
    Iid,
    Intel,
    Efuse,
    Iiduser,
    IntelUser,
}

impl PufType {
    /// Eight digit hex form used in distribution point file names.
    pub fn hex(self) -> String {
        let value: u32 = match self {
            PufType::Iid => 0,
            PufType::Intel => 1,
            PufType::Efuse => 2,
            PufType::Iiduser => 3,
            PufType::IntelUser => 4,
        };
        format!("{value:08x}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    #[default]
    Efuses,
    Bbram,
    Pufss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyWrappingType {
    #[default]
    #[serde(alias = "NONE")]
    Internal,
    UserIidPuf,
    UdsIidPuf,
}

/// Device attributes that must not be provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackList {
    pub rom_versions: BTreeSet<u32>,
    pub sdm_build_id_strings: BTreeSet<String>,
    pub sdm_svns: BTreeSet<u32>,
}

/// Expected public eFuse values. Only bits set in `mask` are compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfusesPublic {
    pub mask: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    pub blacklist: BlackList,
    pub efuses_public: EfusesPublic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AesKey {
    /// Hex of the AES key certificate encrypted under the active sealing key.
    pub value: String,
    pub test_program: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidentialData {
    pub storage_type: StorageType,
    pub aes_key: AesKey,
    pub key_wrapping: KeyWrappingType,
}

/// Per customer provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfiguration {
    pub id: u64,
    pub name: String,
    pub puf_type: PufType,
    pub overbuild_max: i32,
    pub overbuild_current: i32,
    pub require_iid_uds: bool,
    pub test_mode_secrets: bool,
    pub attestation_config: AttestationConfig,
    pub confidential_data: ConfidentialData,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            puf_type: PufType::Efuse,
            overbuild_max: OVERBUILD_MAX_INFINITE,
            overbuild_current: 0,
            require_iid_uds: true,
            test_mode_secrets: false,
            attestation_config: AttestationConfig::default(),
            confidential_data: ConfidentialData::default(),
        }
    }
}

impl ServiceConfiguration {
    pub fn storage_type(&self) -> StorageType {
        self.confidential_data.storage_type
    }

    /// Programmer message types the key wrapping of this configuration
    /// needs. Only PUF based storage hands a wrapped key back.
    pub fn key_wrapping_message_types(&self) -> Vec<MessageType> {
        if self.storage_type() != StorageType::Pufss {
            return Vec::new();
        }
        let mut types = vec![MessageType::PushWrappedKey];
        match self.confidential_data.key_wrapping {
            KeyWrappingType::UserIidPuf => types.push(MessageType::PushWrappedKeyUserIid),
            KeyWrappingType::UdsIidPuf => types.push(MessageType::PushWrappedKeyUdsIid),
            KeyWrappingType::Internal => {}
        }
        types
    }

    /// Message type handing the wrapped key to the programmer. The IID
    /// specific type is preferred when the programmer supports it.
    pub fn wrapped_key_message_type(&self, supported_commands: u32) -> Option<MessageType> {
        let types = self.key_wrapping_message_types();
        types
            .iter()
            .rev()
            .copied()
            .find(|message_type| message_type.is_set_in(supported_commands))
            .or_else(|| types.first().copied())
    }
}

/// Lookup of provisioning configurations by id.
pub trait ConfigurationLookup: Send + Sync {
    fn get_configuration(&self, cfg_id: u64) -> BkpsResult<ServiceConfiguration>;

    /// Increments the overbuild counter unless it would exceed the limit.
    /// Returns the number of updated configurations (0 or 1).
    fn get_configuration_and_update(&self, cfg_id: u64) -> BkpsResult<u32>;
}

/// Configuration store kept in memory.
#[derive(Default)]
pub struct InMemoryConfigurations {
    configurations: Mutex<HashMap<u64, ServiceConfiguration>>,
}

impl InMemoryConfigurations {
    pub fn new() -> Self {
        Self::default()
    }

    fn configurations(&self) -> BkpsResult<MutexGuard<'_, HashMap<u64, ServiceConfiguration>>> {
        self.configurations.lock().map_err(|_| {
            BkpsError::new(
                ErrorKind::PROVISIONING_GENERIC,
                "Configuration store is poisoned.",
            )
        })
    }

    /// Stores `configuration` and returns its id.
    pub fn save(&self, configuration: ServiceConfiguration) -> BkpsResult<u64> {
        let mut configurations = self.configurations()?;
        let id = match configuration.id {
            0 => configurations.keys().max().map_or(1, |max| max + 1),
            id => id,
        };
        configurations.insert(id, ServiceConfiguration { id, ..configuration });
        Ok(id)
    }

    /// Applies `f` to every stored configuration. Stops at the first error
    /// and leaves the remaining configurations untouched.
    pub fn update_all(
        &self,
        mut f: impl FnMut(&mut ServiceConfiguration) -> BkpsResult<()>,
    ) -> BkpsResult<()> {
        let mut configurations = self.configurations()?;
        let mut updated = configurations.clone();
        for configuration in updated.values_mut() {
            f(configuration)?;
        }
        *configurations = updated;
        Ok(())
    }
}

impl ConfigurationLookup for InMemoryConfigurations {
    fn get_configuration(&self, cfg_id: u64) -> BkpsResult<ServiceConfiguration> {
        match self.configurations()?.get(&cfg_id) {
            Some(configuration) => Ok(configuration.clone()),
            None => raise_err!(
                CONFIGURATION_NOT_FOUND,
                "Service configuration with id {cfg_id} does not exist."
            ),
        }
    }

    fn get_configuration_and_update(&self, cfg_id: u64) -> BkpsResult<u32> {
        let mut configurations = self.configurations()?;
        let Some(configuration) = configurations.get_mut(&cfg_id) else {
            raise_err!(
                CONFIGURATION_NOT_FOUND,
                "Service configuration with id {cfg_id} does not exist."
            );
        };
        if configuration.overbuild_max != OVERBUILD_MAX_INFINITE
            && configuration.overbuild_current >= configuration.overbuild_max
        {
            return Ok(0);
        }
        configuration.overbuild_current += 1;
        Ok(1)
    }
}
