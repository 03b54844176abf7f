/*++

Licensed under the Apache-2.0 license.

File Name:

   config.rs

Abstract:

    File contains the service configuration file format and its loader.

--*/

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Distribution point holding device certificates and CRLs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionPointConfig {
    pub main_path: String,

    pub attestation_cert_base_path: String,

    /// SHA-256 fingerprints (hex) of the accepted root certificates.
    pub trusted_root_hash: Vec<String>,
}

impl Default for DistributionPointConfig {
    fn default() -> Self {
        Self {
            main_path: "https://tsci.intel.com".into(),
            attestation_cert_base_path: "content/IPCS".into(),
            trusted_root_hash: Vec::new(),
        }
    }
}

impl DistributionPointConfig {
    /// Base url of the device certificate folder.
    pub fn attestation_url(&self) -> String {
        build_path(&self.main_path, &self.attestation_cert_base_path)
    }
}

/// SPDM transport timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpdmConfig {
    pub response_timeout_ms: u64,

    pub queue_capacity: usize,

    pub retry_count: u32,

    pub retry_delay_ms: u64,
}

impl Default for SpdmConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 60_000,
            queue_capacity: 1,
            retry_count: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl SpdmConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Service Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BkpsConfig {
    pub distribution_point: DistributionPointConfig,

    pub spdm: SpdmConfig,

    pub log_level: String,
}

impl Default for BkpsConfig {
    fn default() -> Self {
        Self {
            distribution_point: DistributionPointConfig::default(),
            spdm: SpdmConfig::default(),
            log_level: "info".into(),
        }
    }
}

/// Load Service Configuration from file
pub fn load_config(path: &Path) -> anyhow::Result<BkpsConfig> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read the config file {}", path.display()))?;

    parse_config(&config_str)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

pub fn parse_config(config_str: &str) -> anyhow::Result<BkpsConfig> {
    let config: BkpsConfig = toml::from_str(config_str)?;
    Ok(config)
}

/// Joins url segments with exactly one slash between them.
pub fn build_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
