// Licensed under the Apache-2.0 license

use crate::configuration::{ConfigurationLookup, PufType, ServiceConfiguration, OVERBUILD_MAX_INFINITE};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Devices provisioned so far, keyed by device id and PUF type.
#[derive(Default)]
pub struct ProvisioningHistory {
    provisioned: Mutex<HashSet<(String, PufType)>>,
}

impl ProvisioningHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(device_id: &str, puf_type: PufType) -> (String, PufType) {
        (device_id.to_ascii_lowercase(), puf_type)
    }

    /// Records the device as provisioned. Returns true the first time.
    pub fn mark_provisioned(&self, device_id: &str, puf_type: PufType) -> BkpsResult<bool> {
        let first_time = self
            .provisioned
            .lock()
            .map_err(|_| poisoned())?
            .insert(Self::key(device_id, puf_type));
        if !first_time {
            log::info!("Performing re-provisioning for device id: {device_id} and puf type: {puf_type:?}");
        }
        Ok(first_time)
    }

    pub fn is_provisioned(&self, device_id: &str, puf_type: PufType) -> BkpsResult<bool> {
        Ok(self
            .provisioned
            .lock()
            .map_err(|_| poisoned())?
            .contains(&Self::key(device_id, puf_type)))
    }
}

fn poisoned() -> BkpsError {
    BkpsError::new(ErrorKind::PROVISIONING_GENERIC, "Provisioning history is poisoned.")
}

/// Enforces the per configuration device limit.
#[derive(Clone)]
pub struct OverbuildCounterManager {
    history: Arc<ProvisioningHistory>,
}

impl OverbuildCounterManager {
    pub fn new(history: Arc<ProvisioningHistory>) -> Self {
        Self { history }
    }

    pub fn verify(&self, configuration: &ServiceConfiguration, device_id: &str) -> BkpsResult<()> {
        let max = configuration.overbuild_max;
        let current = configuration.overbuild_current;
        if max != OVERBUILD_MAX_INFINITE
            && current >= max
            && !self.history.is_provisioned(device_id, configuration.puf_type)?
        {
            raise_err!(
                OVERBUILD_EXCEEDED,
                "Overbuild counter exceeded. Max: {max}, current: {current}."
            );
        }
        Ok(())
    }

    /// Counts the device against the configuration the first time it is
    /// provisioned. Re-provisioning does not change the counter.
    pub fn increment_if_first_provisioning(
        &self,
        lookup: &dyn ConfigurationLookup,
        configuration: &ServiceConfiguration,
        device_id: &str,
    ) -> BkpsResult<()> {
        if !self.history.mark_provisioned(device_id, configuration.puf_type)? {
            return Ok(());
        }
        log::info!("Updating overbuild counter ...");
        if lookup.get_configuration_and_update(configuration.id)? != 1 {
            raise_err!(OVERBUILD_EXCEEDED, "Overbuild counter exceeded.");
        }
        Ok(())
    }
}
