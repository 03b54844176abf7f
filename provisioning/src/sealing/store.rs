// Licensed under the Apache-2.0 license

use super::status::{next_status, SealingKeyEvent, SealingKeyStatus};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Persisted sealing key record. The key itself lives in the enclave under
/// `guid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingKey {
    pub id: u64,
    pub guid: String,
    pub status: SealingKeyStatus,
}

/// Persistence of sealing key records and the backup hash. Every method is
/// one serializable unit of work.
pub trait SealingKeyStore: Send + Sync {
    fn insert(&self, guid: &str, event: SealingKeyEvent) -> BkpsResult<SealingKey>;

    fn find_by_status(&self, status: SealingKeyStatus) -> BkpsResult<Option<SealingKey>>;

    /// Applies `event` to the key in `status`, if any. Returns the updated key.
    fn transition(
        &self,
        status: SealingKeyStatus,
        event: SealingKeyEvent,
    ) -> BkpsResult<Option<SealingKey>>;

    /// Disables the ENABLED key and enables the PENDING one together.
    /// With `clear_backup_hash` the backup hash is dropped in the same unit.
    fn promote_pending(&self, clear_backup_hash: bool) -> BkpsResult<()>;

    /// Records ordered by id.
    fn list(&self) -> BkpsResult<Vec<SealingKey>>;

    fn backup_hash(&self) -> BkpsResult<Option<String>>;

    /// Replaces any stored backup hash with `hash`.
    fn replace_backup_hash(&self, hash: &str) -> BkpsResult<()>;

    fn delete_backup_hashes(&self) -> BkpsResult<()>;
}

#[derive(Default)]
struct Tables {
    keys: Vec<SealingKey>,
    backup_hash: Option<String>,
}

impl Tables {
    fn position(&self, status: SealingKeyStatus) -> Option<usize> {
        self.keys.iter().position(|key| key.status == status)
    }

    fn apply(&mut self, status: SealingKeyStatus, event: SealingKeyEvent) -> BkpsResult<Option<SealingKey>> {
        let Some(index) = self.position(status) else {
            return Ok(None);
        };
        let key = &mut self.keys[index];
        key.status = next_status(Some(key.status), event)?;
        Ok(Some(key.clone()))
    }
}

#[derive(Default)]
pub struct InMemorySealingKeyStore {
    tables: Mutex<Tables>,
}

impl InMemorySealingKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> BkpsResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| {
            BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "Sealing key store is poisoned.")
        })
    }
}

impl SealingKeyStore for InMemorySealingKeyStore {
    fn insert(&self, guid: &str, event: SealingKeyEvent) -> BkpsResult<SealingKey> {
        let status = next_status(None, event)?;
        let mut tables = self.tables()?;
        if tables.position(status).is_some() {
            match status {
                SealingKeyStatus::Pending => raise_err!(
                    SEALING_KEY_ROTATION_PENDING,
                    "A PENDING sealing key already exists."
                ),
                _ => raise_err!(
                    SEALING_KEY_ALREADY_EXISTS,
                    "An ENABLED sealing key already exists."
                ),
            }
        }
        let key = SealingKey {
            id: tables.keys.last().map_or(1, |last| last.id + 1),
            guid: guid.to_string(),
            status,
        };
        tables.keys.push(key.clone());
        Ok(key)
    }

    fn find_by_status(&self, status: SealingKeyStatus) -> BkpsResult<Option<SealingKey>> {
        let tables = self.tables()?;
        Ok(tables.position(status).map(|index| tables.keys[index].clone()))
    }

    fn transition(
        &self,
        status: SealingKeyStatus,
        event: SealingKeyEvent,
    ) -> BkpsResult<Option<SealingKey>> {
        self.tables()?.apply(status, event)
    }

    fn promote_pending(&self, clear_backup_hash: bool) -> BkpsResult<()> {
        let mut tables = self.tables()?;
        if tables.position(SealingKeyStatus::Pending).is_none() {
            raise_err!(SEALING_KEY_DOES_NOT_EXIST, "No PENDING sealing key to activate.");
        }
        let mut staged = Tables {
            keys: tables.keys.clone(),
            backup_hash: tables.backup_hash.clone(),
        };
        staged.apply(SealingKeyStatus::Enabled, SealingKeyEvent::Disable)?;
        staged.apply(SealingKeyStatus::Pending, SealingKeyEvent::Activate)?;
        if clear_backup_hash {
            staged.backup_hash = None;
        }
        *tables = staged;
        Ok(())
    }

    fn list(&self) -> BkpsResult<Vec<SealingKey>> {
        Ok(self.tables()?.keys.clone())
    }

    fn backup_hash(&self) -> BkpsResult<Option<String>> {
        Ok(self.tables()?.backup_hash.clone())
    }

    fn replace_backup_hash(&self, hash: &str) -> BkpsResult<()> {
        self.tables()?.backup_hash = Some(hash.to_string());
        Ok(())
    }

    fn delete_backup_hashes(&self) -> BkpsResult<()> {
        self.tables()?.backup_hash = None;
        Ok(())
    }
}
