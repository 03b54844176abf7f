// Licensed under the Apache-2.0 license

use super::status::{SealingKeyEvent, SealingKeyStatus};
use super::store::{SealingKey, SealingKeyStore};
use crate::configuration::ServiceConfiguration;
use bkps_api::{CertificateCommand, CommandId, CommandLayer};
use bkps_crypto::{
    random_guid, sha256, AesGcmProvider, EncryptionProvider, SecurityEnclave, SecurityObjectType,
};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::sync::Arc;

/// Sealing key records in the store kept in step with their enclave objects.
#[derive(Clone)]
pub struct SealingKeyManager {
    enclave: Arc<dyn SecurityEnclave>,
    store: Arc<dyn SealingKeyStore>,
}

impl SealingKeyManager {
    pub fn new(enclave: Arc<dyn SecurityEnclave>, store: Arc<dyn SealingKeyStore>) -> Self {
        Self { enclave, store }
    }

    pub fn store(&self) -> &Arc<dyn SealingKeyStore> {
        &self.store
    }

    pub fn create_active_key(&self) -> BkpsResult<SealingKey> {
        self.create_key(SealingKeyEvent::CreateActive, |enclave, guid| {
            enclave.create_object(guid, SecurityObjectType::Aes256)
        })
    }

    pub fn create_pending_key(&self) -> BkpsResult<SealingKey> {
        self.create_key(SealingKeyEvent::CreatePending, |enclave, guid| {
            enclave.create_object(guid, SecurityObjectType::Aes256)
        })
    }

    /// Creates a PENDING key whose copy encrypted under `rsa_public_key_der`
    /// is returned for backup.
    pub fn create_exportable_pending_key(&self, rsa_public_key_der: &[u8]) -> BkpsResult<Vec<u8>> {
        let mut wrapped = Vec::new();
        self.create_key(SealingKeyEvent::CreatePending, |enclave, guid| {
            wrapped = enclave.create_exportable(guid, rsa_public_key_der)?;
            Ok(())
        })?;
        Ok(wrapped)
    }

    pub fn import_pending_key(&self, key: &[u8]) -> BkpsResult<SealingKey> {
        self.create_key(SealingKeyEvent::CreatePending, |enclave, guid| {
            enclave.import_aes(guid, key)
        })
    }

    /// The enclave object is removed again when the record cannot be stored.
    fn create_key(
        &self,
        event: SealingKeyEvent,
        create: impl FnOnce(&dyn SecurityEnclave, &str) -> BkpsResult<()>,
    ) -> BkpsResult<SealingKey> {
        let guid = random_guid();
        create(self.enclave.as_ref(), &guid)?;
        if !self.enclave.exists(&guid) {
            raise_err!(
                ENCLAVE_FAILURE,
                "Failed to save sealing key {guid} in security enclave."
            );
        }
        match self.store.insert(&guid, event) {
            Ok(key) => {
                log::info!("Created sealing key {guid} with status {:?}.", key.status);
                Ok(key)
            }
            Err(e) => {
                if let Err(cleanup) = self.enclave.delete(&guid) {
                    log::error!("Failed to remove sealing key {guid} from enclave: {cleanup}");
                }
                Err(e)
            }
        }
    }

    pub fn active_provider(&self) -> BkpsResult<AesGcmProvider> {
        self.provider(SealingKeyStatus::Enabled)
    }

    pub fn pending_provider(&self) -> BkpsResult<AesGcmProvider> {
        self.provider(SealingKeyStatus::Pending)
    }

    fn provider(&self, status: SealingKeyStatus) -> BkpsResult<AesGcmProvider> {
        match self.present_key(status)? {
            Some(key) => Ok(AesGcmProvider::new(self.enclave.clone(), key.guid)),
            None => raise_err!(
                SEALING_KEY_DOES_NOT_EXIST,
                "Sealing key with status {status:?} does not exist."
            ),
        }
    }

    /// CERTIFICATE command carrying the AES key certificate of
    /// `configuration`, unsealed with the active sealing key.
    pub fn certificate_command(&self, configuration: &ServiceConfiguration) -> BkpsResult<Vec<u8>> {
        let aes_key = &configuration.confidential_data.aes_key;
        let unseal = || -> BkpsResult<_> {
            let sealed = hex::decode(&aes_key.value).map_err(|e| {
                BkpsError::new(ErrorKind::CODEC_INVALID_ENCODING, "AES key is not valid hex.").with_source(e)
            })?;
            self.active_provider()?.decrypt(&sealed)
        };
        let certificate = unseal().map_err(|e| {
            BkpsError::new(
                ErrorKind::PROVISIONING_GENERIC,
                "Failed to decrypt sensitive data with sealing key.",
            )
            .with_source(e)
        })?;
        let command = CertificateCommand::new(certificate.to_vec(), aes_key.test_program);
        Ok(CommandLayer::create(&command.build(), CommandId::CERTIFICATE))
    }

    /// The key in `status`, failing when the record exists but the enclave
    /// lost its object.
    fn present_key(&self, status: SealingKeyStatus) -> BkpsResult<Option<SealingKey>> {
        let Some(key) = self.store.find_by_status(status)? else {
            return Ok(None);
        };
        if !self.enclave.exists(&key.guid) {
            raise_err!(
                ENCLAVE_OBJECT_NOT_FOUND,
                "Sealing key {} does not exist in security enclave but exists in database.",
                key.guid
            );
        }
        Ok(Some(key))
    }

    pub fn is_active_sealing_key(&self) -> BkpsResult<bool> {
        Ok(self.present_key(SealingKeyStatus::Enabled)?.is_some())
    }

    pub fn is_pending_sealing_key(&self) -> BkpsResult<bool> {
        Ok(self.present_key(SealingKeyStatus::Pending)?.is_some())
    }

    pub fn is_active_sealing_key_in_database(&self) -> BkpsResult<bool> {
        Ok(self.store.find_by_status(SealingKeyStatus::Enabled)?.is_some())
    }

    /// Disables the PENDING key, if any, and drops its enclave object.
    pub fn disable_pending_key(&self) -> BkpsResult<()> {
        let Some(key) = self
            .store
            .transition(SealingKeyStatus::Pending, SealingKeyEvent::Disable)?
        else {
            return Ok(());
        };
        log::warn!("Disabled PENDING sealing key {}.", key.guid);
        if self.enclave.exists(&key.guid) {
            self.enclave.delete(&key.guid)?;
        }
        Ok(())
    }

    pub fn list(&self) -> BkpsResult<Vec<SealingKey>> {
        log::debug!("Request to get all sealing keys.");
        self.store.list()
    }
}

/// Hash of the last exported backup key, authenticating a later restore.
#[derive(Clone)]
pub struct SealingKeyBackupHashManager {
    store: Arc<dyn SealingKeyStore>,
}

impl SealingKeyBackupHashManager {
    pub fn new(store: Arc<dyn SealingKeyStore>) -> Self {
        Self { store }
    }

    fn hash(encrypted_backup_key: &[u8]) -> String {
        hex::encode(sha256(encrypted_backup_key))
    }

    pub fn update(&self, encrypted_backup_key: &[u8]) -> BkpsResult<()> {
        self.store.replace_backup_hash(&Self::hash(encrypted_backup_key))
    }

    pub fn verify(&self, encrypted_backup_key: &[u8]) -> BkpsResult<()> {
        let Some(stored) = self.store.backup_hash()? else {
            raise_err!(
                SEALING_KEY_BACKUP_HASH_DOES_NOT_EXIST,
                "Sealing key backup hash does not exist."
            );
        };
        if stored != Self::hash(encrypted_backup_key) {
            raise_err!(
                SEALING_KEY_BACKUP_HASH_DOES_NOT_MATCH,
                "Sealing key backup hash does not match provided key."
            );
        }
        Ok(())
    }

    pub fn delete_all(&self) -> BkpsResult<()> {
        self.store.delete_backup_hashes()
    }
}
