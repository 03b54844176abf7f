// Licensed under the Apache-2.0 license

//! Checks a SIGMA message must pass before the flow moves on. Each check
//! is independent; a failure ends the provisioning session.

use crate::configuration::ServiceConfiguration;
use bkps_api::sigma::{SigmaEncMessage, SigmaM2Message};
use bkps_crypto::{ecdsa_verify_raw, hmac_sha384_verify};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use openssl::x509::X509;

pub trait SigmaVerifier {
    fn verify(&self) -> BkpsResult<()>;
}

/// Runs `verifiers` in order and stops at the first failure.
pub fn verify_all(verifiers: &[&dyn SigmaVerifier]) -> BkpsResult<()> {
    verifiers.iter().try_for_each(|verifier| verifier.verify())
}

fn verify_mac(key: &[u8], data: &[u8], mac: &[u8]) -> BkpsResult<()> {
    let valid = hmac_sha384_verify(key, data, mac).map_err(|e| {
        BkpsError::new(ErrorKind::SIGMA_INTEGRITY_VERIFICATION_FAILED, "HMAC verification failed.")
            .with_source(e)
    })?;
    if !valid {
        raise_err!(SIGMA_INTEGRITY_VERIFICATION_FAILED, "HMAC verification failed.");
    }
    Ok(())
}

/// M2 MAC under the protocol MAC key.
pub struct SigmaM2IntegrityVerifier<'a> {
    pub pmk: &'a [u8],
    pub message: &'a SigmaM2Message,
}

impl SigmaVerifier for SigmaM2IntegrityVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        verify_mac(self.pmk, self.message.mac_data(), &self.message.mac)
    }
}

/// M2 signature by the key of the verified device chain leaf.
pub struct SigmaM2SignatureVerifier<'a> {
    pub device_leaf_cert: &'a [u8],
    pub message: &'a SigmaM2Message,
}

impl SigmaVerifier for SigmaM2SignatureVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        let failed = |e: BkpsError| {
            BkpsError::new(
                ErrorKind::SIGMA_SIGNATURE_VERIFICATION_FAILED,
                "Sigma M2 signature verification failed.",
            )
            .with_source(e)
        };
        let key = X509::from_der(self.device_leaf_cert)
            .and_then(|cert| cert.public_key())
            .map_err(|e| failed(BkpsError::new(ErrorKind::CRYPTO_FAILURE, "Invalid device certificate.").with_source(e)))?;
        let valid = ecdsa_verify_raw(&key, self.message.signed_data(), &self.message.signature)
            .map_err(failed)?;
        if !valid {
            raise_err!(
                SIGMA_SIGNATURE_VERIFICATION_FAILED,
                "Sigma M2 signature verification failed."
            );
        }
        Ok(())
    }
}

/// The device echoes the service DH public key unchanged.
pub struct SigmaM2BkpsPubKeyVerifier<'a> {
    pub expected: &'a [u8],
    pub message: &'a SigmaM2Message,
}

impl SigmaVerifier for SigmaM2BkpsPubKeyVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        if self.message.bkps_dh_pub_key[..] != *self.expected {
            raise_err!(
                SIGMA_CONFIGURATION_MISMATCH,
                "BKPS public key in M2 does not match key sent in M1."
            );
        }
        Ok(())
    }
}

/// Blacklist and public eFuse checks from the service configuration.
pub struct SigmaM2WithServiceCfgVerifier<'a> {
    pub configuration: &'a ServiceConfiguration,
    pub message: &'a SigmaM2Message,
}

impl SigmaM2WithServiceCfgVerifier<'_> {
    fn verify_efuses(&self) -> BkpsResult<()> {
        let efuses = &self.configuration.attestation_config.efuses_public;
        if efuses.mask.is_empty() && efuses.value.is_empty() {
            return Ok(());
        }
        let (Ok(mask), Ok(value)) = (hex::decode(&efuses.mask), hex::decode(&efuses.value)) else {
            raise_err!(
                SIGMA_CONFIGURATION_POLICY_VIOLATION,
                "Invalid Efuse response from M2 Message. Configured mask or value is not hex."
            );
        };
        let actual = &self.message.public_efuse_values;
        if mask.len() != actual.len() || value.len() != actual.len() {
            raise_err!(
                SIGMA_CONFIGURATION_POLICY_VIOLATION,
                "Invalid Efuse response from M2 Message. Mask length {} does not match {} bytes.",
                mask.len(),
                actual.len()
            );
        }
        let matches = actual
            .iter()
            .zip(mask.iter().zip(value.iter()))
            .all(|(a, (m, v))| a & m == v & m);
        if !matches {
            raise_err!(
                SIGMA_CONFIGURATION_POLICY_VIOLATION,
                "Invalid Efuse response from M2 Message."
            );
        }
        Ok(())
    }
}

impl SigmaVerifier for SigmaM2WithServiceCfgVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        let blacklist = &self.configuration.attestation_config.blacklist;
        if blacklist.rom_versions.contains(&self.message.rom_version()) {
            raise_err!(SIGMA_CONFIGURATION_POLICY_VIOLATION, "ROM version is blacklisted.");
        }
        if blacklist
            .sdm_build_id_strings
            .contains(&self.message.sdm_fw_build_id_string())
        {
            raise_err!(
                SIGMA_CONFIGURATION_POLICY_VIOLATION,
                "SDM FW build identifier is blacklisted."
            );
        }
        if blacklist.sdm_svns.contains(&self.message.sdm_svn()) {
            raise_err!(SIGMA_CONFIGURATION_POLICY_VIOLATION, "SDM SVN is blacklisted.");
        }
        self.verify_efuses()
    }
}

/// SIGMA_ENC response MAC under the session MAC key.
pub struct SigmaEncIntegrityVerifier<'a> {
    pub smk: &'a [u8],
    pub message: &'a SigmaEncMessage,
}

impl SigmaVerifier for SigmaEncIntegrityVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        verify_mac(self.smk, &self.message.mac_data(), &self.message.mac)
    }
}

/// The response carries the counter the service expects next and the
/// session IV.
pub struct SigmaEncResponseCounterIvVerifier<'a> {
    pub expected_counter: u32,
    pub initial_iv: &'a [u8],
    pub message: &'a SigmaEncMessage,
}

impl SigmaVerifier for SigmaEncResponseCounterIvVerifier<'_> {
    fn verify(&self) -> BkpsResult<()> {
        let actual = self.message.header.message_counter;
        if actual != self.expected_counter {
            raise_err!(
                SIGMA_REPLAY_OR_ORDERING_VIOLATION,
                "Message response counter mismatch. Expected: {}, actual: {actual}.",
                self.expected_counter
            );
        }
        if self.message.header.initial_iv[..] != *self.initial_iv {
            raise_err!(
                SIGMA_REPLAY_OR_ORDERING_VIOLATION,
                "Initial IV in response does not match session IV."
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{AttestationConfig, BlackList, EfusesPublic};
    use crate::testing::TestPki;
    use bkps_api::sigma::{SigmaM2Message, SIGMA_M2_MAGIC};
    use bkps_crypto::{ecdsa_sign_raw, hmac_sha384};
    use zerocopy::FromZeros;

    fn signed_m2(pki: &TestPki, pmk: &[u8]) -> SigmaM2Message {
        let mut m2 = SigmaM2Message::new_zeroed();
        m2.magic = SIGMA_M2_MAGIC;
        m2.bkps_dh_pub_key = [7; 96];
        m2.rom_version_num = 5u32.to_le_bytes();
        m2.sdm_fw_security_version_num = 9u32.to_le_bytes();
        m2.sdm_fw_build_id[..6].copy_from_slice(b"build1");
        m2.public_efuse_values[0] = 0b1010_1111;
        m2.signature = ecdsa_sign_raw(&pki.efuse_leaf.ec_key(), m2.signed_data()).unwrap();
        m2.mac = hmac_sha384(pmk, m2.mac_data()).unwrap();
        m2
    }

    #[test]
    fn test_valid_m2_passes_all() {
        let pki = TestPki::new("Agilex", "01");
        let pmk = [3u8; 48];
        let m2 = signed_m2(&pki, &pmk);
        let configuration = ServiceConfiguration::default();
        verify_all(&[
            &SigmaM2IntegrityVerifier { pmk: &pmk, message: &m2 },
            &SigmaM2SignatureVerifier {
                device_leaf_cert: &pki.efuse_leaf.der,
                message: &m2,
            },
            &SigmaM2BkpsPubKeyVerifier {
                expected: &[7; 96],
                message: &m2,
            },
            &SigmaM2WithServiceCfgVerifier {
                configuration: &configuration,
                message: &m2,
            },
        ])
        .unwrap();
    }

    #[test]
    fn test_single_byte_flips() {
        let pki = TestPki::new("Agilex", "01");
        let pmk = [3u8; 48];

        let mut m2 = signed_m2(&pki, &pmk);
        m2.mac[0] ^= 1;
        let err = SigmaM2IntegrityVerifier { pmk: &pmk, message: &m2 }.verify().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SIGMA_INTEGRITY_VERIFICATION_FAILED);

        let mut m2 = signed_m2(&pki, &pmk);
        m2.signature[10] ^= 1;
        let err = SigmaM2SignatureVerifier {
            device_leaf_cert: &pki.efuse_leaf.der,
            message: &m2,
        }
        .verify()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SIGMA_SIGNATURE_VERIFICATION_FAILED);

        let mut m2 = signed_m2(&pki, &pmk);
        m2.bkps_dh_pub_key[95] ^= 1;
        let err = SigmaM2BkpsPubKeyVerifier {
            expected: &[7; 96],
            message: &m2,
        }
        .verify()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SIGMA_CONFIGURATION_MISMATCH);
    }

    #[test]
    fn test_signature_by_wrong_key() {
        let pki = TestPki::new("Agilex", "01");
        let m2 = signed_m2(&pki, &[0; 48]);
        let err = SigmaM2SignatureVerifier {
            device_leaf_cert: &pki.iid_leaf.der,
            message: &m2,
        }
        .verify()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SIGMA_SIGNATURE_VERIFICATION_FAILED);
    }

    #[test]
    fn test_blacklist_names_field() {
        let pki = TestPki::new("Agilex", "01");
        let m2 = signed_m2(&pki, &[0; 48]);
        let cases = [
            (
                BlackList {
                    rom_versions: [5].into(),
                    ..Default::default()
                },
                "ROM version is blacklisted.",
            ),
            (
                BlackList {
                    sdm_build_id_strings: ["build1".to_string()].into(),
                    ..Default::default()
                },
                "SDM FW build identifier is blacklisted.",
            ),
            (
                BlackList {
                    sdm_svns: [9].into(),
                    ..Default::default()
                },
                "SDM SVN is blacklisted.",
            ),
        ];
        for (blacklist, message) in cases {
            let configuration = ServiceConfiguration {
                attestation_config: AttestationConfig {
                    blacklist,
                    ..Default::default()
                },
                ..Default::default()
            };
            let err = SigmaM2WithServiceCfgVerifier {
                configuration: &configuration,
                message: &m2,
            }
            .verify()
            .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SIGMA_CONFIGURATION_POLICY_VIOLATION);
            assert_eq!(err.message(), message);
        }
    }

    #[test]
    fn test_masked_efuses() {
        let pki = TestPki::new("Agilex", "01");
        let m2 = signed_m2(&pki, &[0; 48]);
        let mut mask = vec![0u8; 256];
        mask[0] = 0x0F;
        let mut value = vec![0u8; 256];
        value[0] = 0x0F;
        let mut configuration = ServiceConfiguration {
            attestation_config: AttestationConfig {
                efuses_public: EfusesPublic {
                    mask: hex::encode(&mask),
                    value: hex::encode(&value),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let verifier = |configuration: &ServiceConfiguration| {
            SigmaM2WithServiceCfgVerifier {
                configuration,
                message: &m2,
            }
            .verify()
        };
        verifier(&configuration).unwrap();

        value[0] = 0x0E;
        configuration.attestation_config.efuses_public.value = hex::encode(&value);
        let err = verifier(&configuration).unwrap_err();
        assert!(err.message().starts_with("Invalid Efuse response from M2 Message."));
    }

    #[test]
    fn test_counter_and_iv() {
        let mut message = bkps_api::sigma::SigmaEncMessage::new(1, 5, [1; 12], 0, vec![0; 32]);
        let check = |message: &SigmaEncMessage, expected: u32, iv: &[u8]| {
            SigmaEncResponseCounterIvVerifier {
                expected_counter: expected,
                initial_iv: iv,
                message,
            }
            .verify()
        };
        check(&message, 5, &[1; 12]).unwrap();
        assert_eq!(
            check(&message, 6, &[1; 12]).unwrap_err().kind(),
            ErrorKind::SIGMA_REPLAY_OR_ORDERING_VIOLATION
        );
        assert_eq!(
            check(&message, 4, &[1; 12]).unwrap_err().kind(),
            ErrorKind::SIGMA_REPLAY_OR_ORDERING_VIOLATION
        );
        message.header.initial_iv[3] = 9;
        assert_eq!(
            check(&message, 5, &[1; 12]).unwrap_err().kind(),
            ErrorKind::SIGMA_REPLAY_OR_ORDERING_VIOLATION
        );
    }
}
