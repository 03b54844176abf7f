// Licensed under the Apache-2.0 license

//! Certificate hierarchy generated at test time, laid out the way the
//! distribution point and the devices publish it, and a device answering
//! SIGMA commands.

#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::Signer;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Extension, X509NameBuilder, X509};
use std::cell::Cell;

pub const TEST_DP_URL: &str = "http://dp.test/content/IPCS";
pub const TEST_BKP_KEY_PURPOSE: &str = "2.16.840.1.113741.1.15.4.2.1";
pub const TEST_ATTEST_INIT_KEY_PURPOSE: &str = "2.23.133.5.4.100.8";

const ECDSA_WITH_SHA384: [u8; 12] = [
    0x30, 0x0A, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x03,
];

pub fn generate_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// A certificate with its private key.
pub struct Issued {
    pub der: Vec<u8>,
    pub key: PKey<Private>,
}

impl Issued {
    pub fn x509(&self) -> X509 {
        X509::from_der(&self.der).unwrap()
    }

    pub fn ec_key(&self) -> EcKey<Private> {
        self.key.ec_key().unwrap()
    }
}

#[derive(Default)]
pub struct CertOptions<'a> {
    pub ca: bool,
    pub key_purpose: Option<&'a str>,
    pub crl_url: Option<String>,
    pub ca_issuers_url: Option<String>,
    pub expired: bool,
}

pub struct CertFactory {
    serial: Cell<u8>,
}

impl CertFactory {
    pub fn new() -> Self {
        Self { serial: Cell::new(1) }
    }

    pub fn issue(
        &self,
        cn: &str,
        key: PKey<Private>,
        issuer: Option<&Issued>,
        options: CertOptions,
    ) -> Issued {
        let serial = self.serial.get();
        self.serial.set(serial + 1);

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        let name = name.build();

        let issuer_cert = issuer.map(Issued::x509);
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&BigNum::from_u32(serial.into()).unwrap().to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        match &issuer_cert {
            Some(cert) => builder.set_issuer_name(cert.subject_name()).unwrap(),
            None => builder.set_issuer_name(&name).unwrap(),
        }
        builder.set_pubkey(&key).unwrap();
        if options.expired {
            builder.set_not_before(&Asn1Time::from_unix(0).unwrap()).unwrap();
            builder.set_not_after(&Asn1Time::from_unix(86_400).unwrap()).unwrap();
        } else {
            builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
            builder.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
        }

        if options.ca {
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
        }
        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(issuer_cert.as_deref(), None))
            .unwrap();
        builder.append_extension(ski).unwrap();
        if let Some(cert) = &issuer_cert {
            let aki = AuthorityKeyIdentifier::new()
                .keyid(true)
                .build(&builder.x509v3_context(Some(cert), None))
                .unwrap();
            builder.append_extension(aki).unwrap();
        }
        if let Some(purpose) = options.key_purpose {
            builder
                .append_extension(ExtendedKeyUsage::new().other(purpose).build().unwrap())
                .unwrap();
        }
        #[allow(deprecated)]
        {
            if let Some(url) = &options.crl_url {
                let ext = X509Extension::new_nid(
                    None,
                    None,
                    Nid::CRL_DISTRIBUTION_POINTS,
                    &format!("URI:{url}"),
                )
                .unwrap();
                builder.append_extension(ext).unwrap();
            }
            if let Some(url) = &options.ca_issuers_url {
                let ext =
                    X509Extension::new_nid(None, None, Nid::INFO_ACCESS, &format!("caIssuers;URI:{url}"))
                        .unwrap();
                builder.append_extension(ext).unwrap();
            }
        }

        let signing_key = issuer.map_or(&key, |issuer| &issuer.key);
        builder.sign(signing_key, MessageDigest::sha384()).unwrap();
        Issued {
            der: builder.build().to_der().unwrap(),
            key,
        }
    }
}

/// Root first service chain for a signing key held elsewhere, given as DER
/// SubjectPublicKeyInfo.
pub fn service_chain(public_key_der: &[u8]) -> Vec<Vec<u8>> {
    let factory = CertFactory::new();
    let root = factory.issue(
        "Test BKPS Root CA",
        generate_key(),
        None,
        CertOptions {
            ca: true,
            ..Default::default()
        },
    );
    let public_key: PKey<Public> = PKey::public_key_from_der(public_key_der).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "Test BKPS Service").unwrap();
    let name = name.build();
    let root_cert = root.x509();
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(100).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(root_cert.subject_name()).unwrap();
    builder.set_pubkey(&public_key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
    builder.sign(&root.key, MessageDigest::sha384()).unwrap();
    vec![root.der, builder.build().to_der().unwrap()]
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => out.extend([0x81, len as u8]),
        _ => out.extend([0x82, (len >> 8) as u8, len as u8]),
    }
    out.extend_from_slice(content);
    out
}

/// Version 2 CRL signed by `issuer` revoking the given serial numbers.
pub fn build_crl(issuer: &Issued, revoked_serials: &[u8]) -> Vec<u8> {
    let mut tbs = der(0x02, &[1]);
    tbs.extend(ECDSA_WITH_SHA384);
    tbs.extend(issuer.x509().subject_name().to_der().unwrap());
    tbs.extend(der(0x17, b"240101000000Z"));
    tbs.extend(der(0x17, b"491231235959Z"));
    if !revoked_serials.is_empty() {
        let entries: Vec<u8> = revoked_serials
            .iter()
            .flat_map(|serial| {
                let mut entry = der(0x02, &[*serial]);
                entry.extend(der(0x17, b"240601000000Z"));
                der(0x30, &entry)
            })
            .collect();
        tbs.extend(der(0x30, &entries));
    }
    let tbs = der(0x30, &tbs);

    let mut signer = Signer::new(MessageDigest::sha384(), &issuer.key).unwrap();
    let mut signature = vec![0];
    signature.extend(signer.sign_oneshot_to_vec(&tbs).unwrap());

    let mut list = tbs;
    list.extend(ECDSA_WITH_SHA384);
    list.extend(der(0x03, &signature));
    der(0x30, &list)
}

pub fn serial_of(der: &[u8]) -> u8 {
    let serial = X509::from_der(der).unwrap().serial_number().to_bn().unwrap();
    serial.to_vec()[0]
}

fn b64_key_id(id: Option<&openssl::asn1::Asn1OctetStringRef>) -> String {
    URL_SAFE_NO_PAD.encode(id.unwrap().as_slice())
}

/// DICE hierarchy for one device:
/// root -> family -> device id (L0) -> firmware (L1) -> UDS eFuse BKP leaf,
/// family -> IID UDS -> UDS IID PUF BKP leaf, and an enrollment certificate
/// carrying the device id key.
pub struct TestPki {
    pub device_id: String,
    pub family_name: String,
    pub root: Issued,
    pub family: Issued,
    pub device_id_cert: Issued,
    pub enrollment: Issued,
    pub firmware: Issued,
    pub efuse_leaf: Issued,
    pub iid_uds: Issued,
    pub iid_leaf: Issued,
    revoked: Vec<u8>,
}

impl TestPki {
    pub fn new(family_name: &str, device_id: &str) -> Self {
        let factory = CertFactory::new();
        let family_lower = family_name.to_lowercase();
        let crl_base = format!("{TEST_DP_URL}/crls/IPCS");

        let root = factory.issue(
            "Test FPGA Root CA",
            generate_key(),
            None,
            CertOptions {
                ca: true,
                ..Default::default()
            },
        );
        let family = factory.issue(
            &format!("Test {family_name} Family CA"),
            generate_key(),
            Some(&root),
            CertOptions {
                ca: true,
                crl_url: Some(format!("{crl_base}.crl")),
                ca_issuers_url: Some(format!("{TEST_DP_URL}/certs/root.cer")),
                ..Default::default()
            },
        );
        let family_issued = CertOptions {
            ca: true,
            crl_url: Some(format!("{crl_base}_{family_lower}.crl")),
            ca_issuers_url: Some(format!("{TEST_DP_URL}/certs/family_{family_lower}.cer")),
            ..Default::default()
        };
        let device_id_key = generate_key();
        let device_id_cert = factory.issue(
            &format!("Test:{family_name}:L0:{device_id}"),
            device_id_key.clone(),
            Some(&family),
            CertOptions {
                crl_url: family_issued.crl_url.clone(),
                ca_issuers_url: family_issued.ca_issuers_url.clone(),
                ca: true,
                ..Default::default()
            },
        );
        let enrollment = factory.issue(
            &format!("Test:{family_name}:ER:{device_id}"),
            device_id_key,
            Some(&family),
            CertOptions {
                crl_url: family_issued.crl_url.clone(),
                ca_issuers_url: family_issued.ca_issuers_url.clone(),
                ca: true,
                ..Default::default()
            },
        );
        let firmware = factory.issue(
            &format!("Test:{family_name}:L1:{device_id}"),
            generate_key(),
            Some(&device_id_cert),
            CertOptions {
                ca: true,
                crl_url: Some(format!("{crl_base}_{family_lower}_L1.crl")),
                ..Default::default()
            },
        );
        let efuse_leaf = factory.issue(
            &format!("Test:{family_name}:BKP:{device_id}"),
            generate_key(),
            Some(&firmware),
            CertOptions {
                key_purpose: Some(TEST_BKP_KEY_PURPOSE),
                ..Default::default()
            },
        );
        let iid_uds = factory.issue(
            &format!("Test:{family_name}:IID UDS:{device_id}"),
            generate_key(),
            Some(&family),
            family_issued,
        );
        let iid_leaf = factory.issue(
            &format!("Test:{family_name}:IID BKP:{device_id}"),
            generate_key(),
            Some(&iid_uds),
            CertOptions {
                key_purpose: Some(TEST_BKP_KEY_PURPOSE),
                ..Default::default()
            },
        );

        Self {
            device_id: device_id.to_string(),
            family_name: family_name.to_string(),
            root,
            family,
            device_id_cert,
            enrollment,
            firmware,
            efuse_leaf,
            iid_uds,
            iid_leaf,
            revoked: Vec::new(),
        }
    }

    pub fn root(&self) -> &[u8] {
        &self.root.der
    }

    /// Leaf first.
    pub fn efuse_chain(&self) -> Vec<Vec<u8>> {
        vec![
            self.efuse_leaf.der.clone(),
            self.firmware.der.clone(),
            self.device_id_cert.der.clone(),
            self.family.der.clone(),
            self.root.der.clone(),
        ]
    }

    /// Leaf first.
    pub fn iid_chain(&self) -> Vec<Vec<u8>> {
        vec![
            self.iid_leaf.der.clone(),
            self.iid_uds.der.clone(),
            self.family.der.clone(),
            self.root.der.clone(),
        ]
    }

    /// CRL referenced by certificates the family CA issued.
    pub fn crl_url(&self) -> String {
        format!("{TEST_DP_URL}/crls/IPCS_{}.crl", self.family_name.to_lowercase())
    }

    pub fn l1_crl_url(&self) -> String {
        format!("{TEST_DP_URL}/crls/IPCS_{}_L1.crl", self.family_name.to_lowercase())
    }

    pub fn root_crl_url(&self) -> String {
        format!("{TEST_DP_URL}/crls/IPCS.crl")
    }

    pub fn revoke(&mut self, der: &[u8]) {
        self.revoked.push(serial_of(der));
    }

    fn revoked_by(&self, issuer: &Issued) -> Vec<u8> {
        let issuer_name = issuer.x509().subject_name().to_der().unwrap();
        let revoked: Vec<u8> = [
            &self.family,
            &self.device_id_cert,
            &self.enrollment,
            &self.firmware,
            &self.efuse_leaf,
            &self.iid_uds,
            &self.iid_leaf,
        ]
        .iter()
        .filter(|cert| {
            cert.x509().issuer_name().to_der().unwrap() == issuer_name
                && self.revoked.contains(&serial_of(&cert.der))
        })
        .map(|cert| serial_of(&cert.der))
        .collect();
        revoked
    }

    pub fn crls(&self) -> Vec<(String, Vec<u8>)> {
        vec![
            (self.root_crl_url(), build_crl(&self.root, &self.revoked_by(&self.root))),
            (self.crl_url(), build_crl(&self.family, &self.revoked_by(&self.family))),
            (
                self.l1_crl_url(),
                build_crl(&self.device_id_cert, &self.revoked_by(&self.device_id_cert)),
            ),
        ]
    }

    pub fn device_id_url(&self) -> String {
        format!(
            "{TEST_DP_URL}/certs/deviceid_{}_{}.cer",
            self.device_id,
            b64_key_id(self.enrollment.x509().subject_key_id())
        )
    }

    pub fn iid_uds_url(&self) -> String {
        format!(
            "{TEST_DP_URL}/certs/iiduds_{}_{}.cer",
            self.device_id,
            b64_key_id(self.enrollment.x509().authority_key_id())
        )
    }

    /// Everything the distribution point serves for this device.
    pub fn dp_files(&self) -> Vec<(String, Vec<u8>)> {
        let mut files = vec![
            (self.device_id_url(), self.device_id_cert.der.clone()),
            (self.iid_uds_url(), self.iid_uds.der.clone()),
            (
                format!(
                    "{TEST_DP_URL}/certs/family_{}.cer",
                    self.family_name.to_lowercase()
                ),
                self.family.der.clone(),
            ),
            (format!("{TEST_DP_URL}/certs/root.cer"), self.root.der.clone()),
        ];
        files.extend(self.crls());
        files
    }
}

/// S10 hierarchy: root -> family -> attestation leaf published on the
/// distribution point under the device id.
pub struct S10TestPki {
    pub device_id: String,
    pub root: Issued,
    pub family: Issued,
    pub attestation: Issued,
}

impl S10TestPki {
    pub fn new(device_id: &str) -> Self {
        let factory = CertFactory::new();
        let root = factory.issue(
            "Test FPGA Root CA",
            generate_key(),
            None,
            CertOptions {
                ca: true,
                ..Default::default()
            },
        );
        let family = factory.issue(
            "Test Stratix10 Family CA",
            generate_key(),
            Some(&root),
            CertOptions {
                ca: true,
                crl_url: Some(format!("{TEST_DP_URL}/crls/IPCS.crl")),
                ca_issuers_url: Some(format!("{TEST_DP_URL}/certs/root.cer")),
                ..Default::default()
            },
        );
        let attestation = factory.issue(
            &format!("Test:Stratix10:ATTESTATION:{device_id}"),
            generate_key(),
            Some(&family),
            CertOptions {
                crl_url: Some(format!("{TEST_DP_URL}/crls/IPCS_stratix10.crl")),
                ca_issuers_url: Some(format!("{TEST_DP_URL}/certs/family_stratix10.cer")),
                ..Default::default()
            },
        );
        Self {
            device_id: device_id.to_string(),
            root,
            family,
            attestation,
        }
    }

    pub fn chain(&self) -> Vec<Vec<u8>> {
        vec![
            self.attestation.der.clone(),
            self.family.der.clone(),
            self.root.der.clone(),
        ]
    }

    pub fn dp_files(&self) -> Vec<(String, Vec<u8>)> {
        vec![
            (
                format!("{TEST_DP_URL}/certs/attestation_{}_00000002.cer", self.device_id),
                self.attestation.der.clone(),
            ),
            (
                format!("{TEST_DP_URL}/certs/family_stratix10.cer"),
                self.family.der.clone(),
            ),
            (format!("{TEST_DP_URL}/certs/root.cer"), self.root.der.clone()),
            (format!("{TEST_DP_URL}/crls/IPCS.crl"), build_crl(&self.root, &[])),
            (
                format!("{TEST_DP_URL}/crls/IPCS_stratix10.crl"),
                build_crl(&self.family, &[]),
            ),
        ]
    }
}

/// How the simulated device proves its identity.
pub enum DeviceIdentity {
    Dice(TestPki),
    S10(S10TestPki),
}

impl DeviceIdentity {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceIdentity::Dice(pki) => &pki.device_id,
            DeviceIdentity::S10(pki) => &pki.device_id,
        }
    }

    pub fn root(&self) -> &[u8] {
        match self {
            DeviceIdentity::Dice(pki) => &pki.root.der,
            DeviceIdentity::S10(pki) => &pki.root.der,
        }
    }

    pub fn dp_files(&self) -> Vec<(String, Vec<u8>)> {
        match self {
            DeviceIdentity::Dice(pki) => pki.dp_files(),
            DeviceIdentity::S10(pki) => pki.dp_files(),
        }
    }

    fn attestation_key(&self) -> EcKey<Private> {
        match self {
            DeviceIdentity::Dice(pki) => pki.efuse_leaf.ec_key(),
            DeviceIdentity::S10(pki) => pki.attestation.ec_key(),
        }
    }
}

struct DeviceSession {
    sdm_session_id: u32,
    pmk: Vec<u8>,
    sek: Vec<u8>,
    smk: Vec<u8>,
}

/// Secure device manager answering SIGMA mailbox commands the way the
/// firmware does.
pub struct SigmaDeviceSim {
    pub identity: DeviceIdentity,
    pub rom_version: u32,
    pub sdm_svn: u32,
    pub sdm_build_id: String,
    pub public_efuses: [u8; bkps_api::sigma::PUBLIC_EFUSE_LEN],
    /// Returned as CERTIFICATE response data.
    pub wrapped_key: Vec<u8>,
    pub corrupt_m2_mac: bool,
    pub corrupt_m2_signature: bool,
    pub replay_response_counter: bool,
    pub erased: bool,
    pub received_aes_key: Option<Vec<u8>>,
    pub torn_down: bool,
    session: Option<DeviceSession>,
}

impl SigmaDeviceSim {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            rom_version: 1,
            sdm_svn: 2,
            sdm_build_id: "21.3.0".into(),
            public_efuses: [0; bkps_api::sigma::PUBLIC_EFUSE_LEN],
            wrapped_key: Vec::new(),
            corrupt_m2_mac: false,
            corrupt_m2_signature: false,
            replay_response_counter: false,
            erased: false,
            received_aes_key: None,
            torn_down: false,
            session: None,
        }
    }

    pub fn device_id_bytes(&self) -> Vec<u8> {
        hex::decode(self.identity.device_id()).unwrap()
    }

    /// Answers the SEND_PACKET messages. Other message types stay with the
    /// programmer.
    pub fn respond_all(
        &mut self,
        messages: &[bkps_api::ProgrammerMessage],
    ) -> Vec<bkps_api::ProgrammerResponse> {
        messages
            .iter()
            .filter(|message| message.message_type == bkps_api::MessageType::SendPacket)
            .map(|message| bkps_api::ProgrammerResponse::new(self.respond(&message.value)))
            .collect()
    }

    pub fn respond(&mut self, frame: &[u8]) -> Vec<u8> {
        use bkps_api::{CommandHeader, CommandId, CommandLayer, EndiannessActor, ResponseCode};
        let header = CommandHeader::decode(frame, EndiannessActor::Firmware).unwrap();
        let body = &frame[4..4 + header.arg_len as usize * 4];
        match CommandId(header.code.into()) {
            CommandId::GET_CHIPID => CommandLayer::response(&self.device_id_bytes(), ResponseCode::OK),
            CommandId::SIGMA_TEARDOWN => {
                self.torn_down = true;
                self.session = None;
                CommandLayer::response(&[], ResponseCode::OK)
            }
            CommandId::GET_ATTESTATION_CERTIFICATE => self.certificate(body),
            CommandId::SIGMA_M1 => self.m2(body),
            CommandId::SIGMA_M3 => self.m3(body),
            CommandId::SIGMA_ENC => self.enc(body),
            _ => CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND),
        }
    }

    fn certificate(&self, body: &[u8]) -> Vec<u8> {
        use bkps_api::{CertificateRequestType, CommandLayer, GetCertificateResponse, ResponseCode};
        let DeviceIdentity::Dice(pki) = &self.identity else {
            return CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND);
        };
        let certificate_type =
            CertificateRequestType(u32::from_le_bytes(body[..4].try_into().unwrap()));
        let der = match certificate_type {
            CertificateRequestType::DEVICE_ID_ENROLLMENT => &pki.enrollment.der,
            CertificateRequestType::FIRMWARE => &pki.firmware.der,
            CertificateRequestType::UDS_EFUSE_BKP => &pki.efuse_leaf.der,
            CertificateRequestType::UDS_IID_PUF_BKP => &pki.iid_leaf.der,
            _ => return CommandLayer::response(&[], ResponseCode::INVALID_COMMAND_PARAMS),
        };
        let response = GetCertificateResponse::new(certificate_type, der.clone()).build();
        CommandLayer::response(&response, ResponseCode::OK)
    }

    fn m2(&mut self, body: &[u8]) -> Vec<u8> {
        use bkps_api::sigma::{SigmaM1Message, SigmaM2Message, SIGMA_M2_MAGIC};
        use bkps_api::{CommandLayer, ResponseCode};
        use zerocopy::{FromBytes, FromZeros, IntoBytes};

        let (m1, _service_chain) = SigmaM1Message::read_from_prefix(body).unwrap();
        let dh = bkps_crypto::EcdhKeyPair::generate().unwrap();
        let session = derive_session(&dh, &m1.bkps_dh_pub_key, 0x0000_0011);

        let mut m2 = SigmaM2Message::new_zeroed();
        m2.magic = SIGMA_M2_MAGIC;
        m2.sdm_session_id = session.sdm_session_id;
        m2.device_unique_id.copy_from_slice(&self.device_id_bytes());
        m2.rom_version_num = self.rom_version.to_le_bytes();
        m2.sdm_fw_security_version_num = self.sdm_svn.to_le_bytes();
        m2.sdm_fw_build_id[..self.sdm_build_id.len()].copy_from_slice(self.sdm_build_id.as_bytes());
        m2.public_efuse_values = self.public_efuses;
        m2.device_dh_pub_key = dh.public_key_raw().unwrap();
        m2.bkps_dh_pub_key = m1.bkps_dh_pub_key;
        m2.signature =
            bkps_crypto::ecdsa_sign_raw(&self.identity.attestation_key(), m2.signed_data()).unwrap();
        if self.corrupt_m2_signature {
            m2.signature[10] ^= 0xFF;
        }
        m2.mac = bkps_crypto::hmac_sha384(&session.pmk, m2.mac_data()).unwrap();
        if self.corrupt_m2_mac {
            m2.mac[0] ^= 0xFF;
        }
        self.session = Some(session);
        CommandLayer::response(m2.as_bytes(), ResponseCode::OK)
    }

    fn m3(&mut self, body: &[u8]) -> Vec<u8> {
        use bkps_api::sigma::SigmaM3Message;
        use bkps_api::{CommandLayer, ResponseCode};
        use zerocopy::FromBytes;

        let session = self.session.as_ref().unwrap();
        let m3 = SigmaM3Message::read_from_bytes(body).unwrap();
        if m3.sdm_session_id != session.sdm_session_id
            || !bkps_crypto::hmac_sha384_verify(&session.pmk, m3.mac_data(), &m3.mac).unwrap()
        {
            return CommandLayer::response(&[], ResponseCode::AUTHENTICATION_FAIL);
        }
        CommandLayer::response(&[], ResponseCode::OK)
    }

    fn enc(&mut self, body: &[u8]) -> Vec<u8> {
        use bkps_api::sigma::SigmaEncMessage;
        use bkps_api::{
            CertificateCommand, CertificateResponse, CommandHeader, CommandId, CommandLayer,
            DecryptedPayload, EncryptedPayload, EndiannessActor, ResponseCode,
        };

        let session = self.session.as_ref().unwrap();
        let request = SigmaEncMessage::parse(body).unwrap();
        if !bkps_crypto::hmac_sha384_verify(&session.smk, &request.mac_data(), &request.mac).unwrap() {
            return CommandLayer::response(&[], ResponseCode::AUTHENTICATION_FAIL);
        }
        let block = counter_block(&request.header.initial_iv, request.header.message_counter);
        let decrypted = bkps_crypto::aes256_ctr(&session.sek, &block, &request.encrypted_payload).unwrap();
        let inner = DecryptedPayload::parse(&decrypted, request.header.number_of_padding_bytes.into())
            .unwrap()
            .value;
        let inner_header = CommandHeader::decode(&inner, EndiannessActor::Firmware).unwrap();
        let inner_body = &inner[4..4 + inner_header.arg_len as usize * 4];
        let inner_response = match CommandId(inner_header.code.into()) {
            CommandId::VOLATILE_AES_ERASE => {
                self.erased = true;
                CommandLayer::response(&[], ResponseCode::OK)
            }
            CommandId::CERTIFICATE => {
                self.received_aes_key =
                    Some(CertificateCommand::parse(inner_body).unwrap().aes_key_certificate);
                let response = CertificateResponse::new(
                    CertificateResponse::PROCESS_COMPLETED,
                    self.wrapped_key.clone(),
                );
                CommandLayer::response(&response.build(), ResponseCode::OK)
            }
            _ => CommandLayer::response(&[], ResponseCode::UNKNOWN_COMMAND),
        };

        let counter = match self.replay_response_counter {
            true => request.header.message_counter,
            false => request.header.message_counter + 1,
        };
        let payload = EncryptedPayload::new(inner_response);
        let block = counter_block(&request.header.initial_iv, counter);
        let ciphertext = bkps_crypto::aes256_ctr(&session.sek, &block, &payload.build()).unwrap();
        let mut response = SigmaEncMessage::new(
            session.sdm_session_id,
            counter,
            request.header.initial_iv,
            payload.padding_len(),
            ciphertext,
        );
        response.mac = bkps_crypto::hmac_sha384(&session.smk, &response.mac_data()).unwrap();
        CommandLayer::response(&response.build(), ResponseCode::OK)
    }
}

fn derive_session(dh: &bkps_crypto::EcdhKeyPair, peer: &[u8], sdm_session_id: u32) -> DeviceSession {
    use bkps_crypto::{kdf_hmac_sha384_counter, SHA384_LEN};
    let shared = dh.shared_secret(peer).unwrap();
    let derive = |label: &[u8]| kdf_hmac_sha384_counter(&shared, label, b"SIGMA", SHA384_LEN).unwrap().to_vec();
    let mut sek = derive(b"SEK");
    sek.truncate(32);
    DeviceSession {
        sdm_session_id,
        pmk: derive(b"PMK"),
        sek,
        smk: derive(b"SMK"),
    }
}

fn counter_block(iv: &[u8; 12], counter: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..12].copy_from_slice(iv);
    block[12..].copy_from_slice(&counter.to_be_bytes());
    block
}
