// Licensed under the Apache-2.0 license

use super::manager::{SealingKeyBackupHashManager, SealingKeyManager};
use crate::configuration::InMemoryConfigurations;
use bkps_crypto::{EncryptionProvider, SecurityEnclave, SecurityObjectType};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::sync::{Arc, Mutex};

/// Secrets stored encrypted under the active sealing key, as hex.
pub trait SealedAssets: Send + Sync {
    /// Replaces every sealed value with `reencrypt(value)`. Either all
    /// values are replaced or, on error, none.
    fn reencrypt_all(
        &self,
        reencrypt: &mut dyn FnMut(&str) -> BkpsResult<String>,
    ) -> BkpsResult<usize>;
}

impl SealedAssets for InMemoryConfigurations {
    fn reencrypt_all(
        &self,
        reencrypt: &mut dyn FnMut(&str) -> BkpsResult<String>,
    ) -> BkpsResult<usize> {
        let mut count = 0;
        self.update_all(|configuration| {
            let aes_key = &mut configuration.confidential_data.aes_key;
            if !aes_key.value.is_empty() {
                aes_key.value = reencrypt(&aes_key.value)?;
                count += 1;
            }
            Ok(())
        })?;
        Ok(count)
    }
}

/// RSA key in the enclave that receives sealing key backups on restore.
#[derive(Clone)]
pub struct ImportKeyManager {
    enclave: Arc<dyn SecurityEnclave>,
    alias: String,
}

impl ImportKeyManager {
    pub fn new(enclave: Arc<dyn SecurityEnclave>, alias: impl Into<String>) -> Self {
        Self {
            enclave,
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Creates the import key unless it already exists.
    pub fn create(&self) -> BkpsResult<()> {
        if self.enclave.exists(&self.alias) {
            return Ok(());
        }
        self.enclave.create_object(&self.alias, SecurityObjectType::Rsa)
    }

    /// DER SubjectPublicKeyInfo handed to the party producing a backup.
    pub fn public_key(&self) -> BkpsResult<Vec<u8>> {
        self.enclave.public_key(&self.alias)
    }

    fn decrypt(&self, data: &[u8]) -> BkpsResult<zeroize::Zeroizing<Vec<u8>>> {
        self.enclave.decrypt_rsa(&self.alias, data)
    }
}

fn reencrypt(active: &dyn EncryptionProvider, pending: &dyn EncryptionProvider, value: &str) -> BkpsResult<String> {
    let Ok(sealed) = hex::decode(value) else {
        raise_err!(CODEC_INVALID_ENCODING, "Sealed asset is not valid hex.");
    };
    let plain = active.decrypt(&sealed)?;
    Ok(hex::encode(pending.encrypt(&plain)?))
}

/// Rotation, backup and restore of the sealing key. A failure after the
/// PENDING key exists disables that key before the error is returned.
pub struct SealingKeyRotationHandler {
    manager: SealingKeyManager,
    backup_hash: SealingKeyBackupHashManager,
    import_key: ImportKeyManager,
    assets: Arc<dyn SealedAssets>,
    transaction: Mutex<()>,
}

impl SealingKeyRotationHandler {
    pub fn new(
        manager: SealingKeyManager,
        import_key: ImportKeyManager,
        assets: Arc<dyn SealedAssets>,
    ) -> Self {
        Self {
            backup_hash: SealingKeyBackupHashManager::new(manager.store().clone()),
            manager,
            import_key,
            assets,
            transaction: Mutex::new(()),
        }
    }

    fn serialized<R>(&self, f: impl FnOnce() -> BkpsResult<R>) -> BkpsResult<R> {
        let _guard = self.transaction.lock().map_err(|_| {
            BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "Sealing key transaction lock is poisoned.")
        })?;
        f()
    }

    /// Runs `f`; on failure disables the PENDING key as a separate step and
    /// wraps the cause.
    fn compensated<R>(&self, f: impl FnOnce() -> BkpsResult<R>) -> BkpsResult<R> {
        f().map_err(|e| {
            log::error!("Sealing key transaction failed: {e}. Disabling PENDING sealing key.");
            if let Err(cleanup) = self.manager.disable_pending_key() {
                log::error!("Failed to disable PENDING sealing key: {cleanup}");
            }
            BkpsError::new(
                ErrorKind::SEALING_KEY_ROTATION_FAILED,
                "Exception occurred during Sealing Key rotation.",
            )
            .with_source(e)
        })
    }

    fn reencrypt_all_assets_and_activate_pending_key(&self) -> BkpsResult<()> {
        log::debug!("Starting reencryption of all assets with new sealing key.");
        let active = self.manager.active_provider()?;
        let pending = self.manager.pending_provider()?;
        let count = self
            .assets
            .reencrypt_all(&mut |value: &str| reencrypt(&active, &pending, value))?;
        self.manager.store().promote_pending(false)?;
        log::info!("Finished to reencrypt {count} sealed assets.");
        Ok(())
    }

    pub fn rotate(&self) -> BkpsResult<()> {
        self.serialized(|| {
            self.compensated(|| {
                self.manager.active_provider()?;
                self.manager.create_pending_key()?;
                self.reencrypt_all_assets_and_activate_pending_key()
            })
        })
    }

    /// Rotates to a new exportable key and returns it encrypted under
    /// `rsa_import_public_key_der`, as hex.
    pub fn backup(&self, rsa_import_public_key_der: &[u8]) -> BkpsResult<String> {
        self.serialized(|| {
            self.compensated(|| {
                self.manager.active_provider()?;
                let encrypted_backup_key = self
                    .manager
                    .create_exportable_pending_key(rsa_import_public_key_der)?;
                self.reencrypt_all_assets_and_activate_pending_key()?;
                self.backup_hash.update(&encrypted_backup_key)?;
                Ok(hex::encode(encrypted_backup_key))
            })
        })
    }

    /// Activates a key produced by [`Self::backup`]. The hash check happens
    /// before the enclave touches the blob.
    pub fn restore(&self, encrypted_sealing_key: &str) -> BkpsResult<()> {
        self.serialized(|| {
            let Ok(encrypted) = hex::decode(encrypted_sealing_key.trim()) else {
                raise_err!(CODEC_INVALID_ENCODING, "Encrypted sealing key is not valid hex.");
            };
            self.backup_hash.verify(&encrypted)?;
            self.compensated(|| {
                let key = self.import_key.decrypt(&encrypted)?;
                self.manager.import_pending_key(&key)?;
                self.manager.store().promote_pending(true)
            })
        })
    }
}
