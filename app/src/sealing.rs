// Licensed under the Apache-2.0 license

use anyhow::Context;
use bkps_crypto::OpensslEnclave;
use bkps_provisioning::configuration::InMemoryConfigurations;
use bkps_provisioning::sealing::{
    ImportKeyManager, InMemorySealingKeyStore, SealingKeyManager, SealingKeyRotationHandler,
    SealingKeyService,
};
use openssl::pkey::PKey;
use std::path::Path;
use std::sync::Arc;

const IMPORT_KEY_ALIAS: &str = "bkps-import";

fn import_key_pem(import_key: &ImportKeyManager) -> anyhow::Result<String> {
    let der = import_key.public_key()?;
    let pem = PKey::public_key_from_der(&der)?.public_key_to_pem()?;
    Ok(String::from_utf8(pem)?)
}

/// Creates a sealing key, then rotates, backs up and restores it as asked.
pub(crate) fn run_cmd(rotations: u32, backup: Option<&Path>, restore: bool) -> anyhow::Result<()> {
    let enclave = Arc::new(OpensslEnclave::new());
    let manager = SealingKeyManager::new(enclave.clone(), Arc::new(InMemorySealingKeyStore::new()));
    let import_key = ImportKeyManager::new(enclave.clone(), IMPORT_KEY_ALIAS);
    import_key.create()?;
    let import_key_pem = import_key_pem(&import_key)?;
    let handler = SealingKeyRotationHandler::new(
        manager.clone(),
        import_key,
        Arc::new(InMemoryConfigurations::new()),
    );
    let service = SealingKeyService::new(manager, handler);

    let key = service.create_sealing_key()?;
    log::info!("Active sealing key: {}", key.guid);
    for _ in 0..rotations {
        service.rotate_sealing_key()?;
    }

    if let Some(path) = backup {
        let encrypted = service.backup(&import_key_pem)?;
        std::fs::write(path, &encrypted)
            .with_context(|| format!("Failed to write backup to {}", path.display()))?;
        log::info!("Sealing key backup written to {}", path.display());

        if restore {
            let encrypted = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read backup from {}", path.display()))?;
            service.restore(&encrypted)?;
        }
    }

    for key in service.get_all_sealing_keys()? {
        println!("{:>4} {} {:?}", key.id, key.guid, key.status);
    }
    Ok(())
}
