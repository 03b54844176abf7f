// Licensed under the Apache-2.0 license

//! At-rest sealing key lifecycle: creation, rotation, backup and restore.

mod handler;
mod manager;
mod service;
mod status;
mod store;

pub use handler::{ImportKeyManager, SealedAssets, SealingKeyRotationHandler};
pub use manager::{SealingKeyBackupHashManager, SealingKeyManager};
pub use service::SealingKeyService;
pub use status::{next_status, SealingKeyEvent, SealingKeyStatus};
pub use store::{InMemorySealingKeyStore, SealingKey, SealingKeyStore};
