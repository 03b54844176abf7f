// Licensed under the Apache-2.0 license

use super::handler::SealingKeyRotationHandler;
use super::manager::SealingKeyManager;
use super::store::SealingKey;
use crate::configuration::{InMemoryConfigurations, ServiceConfiguration};
use bkps_crypto::EncryptionProvider;
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use openssl::pkey::PKey;

/// Administrative sealing key operations with their preconditions.
pub struct SealingKeyService {
    manager: SealingKeyManager,
    handler: SealingKeyRotationHandler,
}

impl SealingKeyService {
    pub fn new(manager: SealingKeyManager, handler: SealingKeyRotationHandler) -> Self {
        Self { manager, handler }
    }

    fn throw_if_rotation_pending(&self) -> BkpsResult<()> {
        if self.manager.is_pending_sealing_key()? {
            raise_err!(SEALING_KEY_ROTATION_PENDING, "Sealing key rotation is pending.");
        }
        Ok(())
    }

    fn throw_if_no_active_key(&self) -> BkpsResult<()> {
        if !self.manager.is_active_sealing_key()? {
            raise_err!(SEALING_KEY_DOES_NOT_EXIST, "Active sealing key does not exist.");
        }
        Ok(())
    }

    pub fn create_sealing_key(&self) -> BkpsResult<SealingKey> {
        self.throw_if_rotation_pending()?;
        if self.manager.is_active_sealing_key()? {
            raise_err!(SEALING_KEY_ALREADY_EXISTS, "Active sealing key already exists.");
        }
        log::info!("Creating new Sealing Key...");
        self.manager.create_active_key()
    }

    pub fn rotate_sealing_key(&self) -> BkpsResult<()> {
        self.throw_if_rotation_pending()?;
        self.throw_if_no_active_key()?;
        log::info!("Starting Sealing Key rotation...");
        self.handler.rotate()
    }

    /// Returns the new sealing key encrypted under the PEM RSA public key,
    /// as hex.
    pub fn backup(&self, rsa_import_public_key_pem: &str) -> BkpsResult<String> {
        self.throw_if_rotation_pending()?;
        self.throw_if_no_active_key()?;
        log::info!("Starting to backup all ServiceConfigurations with Backup Sealing Key...");
        let public_key_der = PKey::public_key_from_pem(rsa_import_public_key_pem.as_bytes())
            .and_then(|key| key.public_key_to_der())
            .map_err(|e| {
                BkpsError::new(ErrorKind::SEALING_KEY_BACKUP_FAILED, "Invalid RSA import public key.")
                    .with_source(e)
            })?;
        self.handler.backup(&public_key_der).map_err(|e| {
            BkpsError::new(ErrorKind::SEALING_KEY_BACKUP_FAILED, "Sealing key backup failed.")
                .with_source(e)
        })
    }

    pub fn restore(&self, encrypted_sealing_key: &str) -> BkpsResult<()> {
        self.throw_if_rotation_pending()?;
        if !self.manager.is_active_sealing_key_in_database()? {
            raise_err!(SEALING_KEY_DOES_NOT_EXIST, "Active sealing key does not exist.");
        }
        log::info!("Starting to restore ServiceConfigurations with Backup Sealing Key...");
        self.handler.restore(encrypted_sealing_key).map_err(|e| {
            if e.kind() == ErrorKind::SEALING_KEY_BACKUP_HASH_DOES_NOT_MATCH
                || e.kind() == ErrorKind::SEALING_KEY_BACKUP_HASH_DOES_NOT_EXIST
            {
                return e;
            }
            BkpsError::new(ErrorKind::SEALING_KEY_RESTORE_FAILED, "Sealing key restore failed.")
                .with_source(e)
        })
    }

    pub fn get_all_sealing_keys(&self) -> BkpsResult<Vec<SealingKey>> {
        self.manager.list()
    }

    /// Stores `configuration` with `aes_key` sealed under the active key.
    /// Rejected while a rotation is pending.
    pub fn save_configuration(
        &self,
        configurations: &InMemoryConfigurations,
        mut configuration: ServiceConfiguration,
        aes_key: &[u8],
    ) -> BkpsResult<u64> {
        self.throw_if_rotation_pending()?;
        self.throw_if_no_active_key()?;
        let provider = self.manager.active_provider()?;
        configuration.confidential_data.aes_key.value = hex::encode(provider.encrypt(aes_key)?);
        configurations.save(configuration)
    }
}
