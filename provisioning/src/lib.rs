/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the key provisioning service: SIGMA and SPDM flows,
    device certificate chain handling and the sealing key lifecycle.

--*/

pub mod chain;
pub mod config;
pub mod configuration;
pub mod context;
pub mod history;
pub mod provisioning;
pub mod sealing;
pub mod sigma;
pub mod spdm;

#[cfg(test)]
mod testing;

pub use config::{load_config, parse_config, BkpsConfig, DistributionPointConfig, SpdmConfig};
pub use provisioning::{ProvisioningRequest, ProvisioningResponse, ProvisioningService};
