// Licensed under the Apache-2.0 license

//! SIGMA wire structures. Multi-byte integers are little-endian. Each
//! message starts with a reserved word that mirrors the command header slot.

use crate::read_u32_le;
use bkps_error::{raise_err, BkpsResult};
use core::mem::{offset_of, size_of};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const SIGMA_PUB_KEY_LEN: usize = 96;
pub const SIGMA_SIGNATURE_LEN: usize = 96;
pub const SIGMA_MAC_LEN: usize = 48;
pub const SIGMA_IV_LEN: usize = 12;
pub const DEVICE_UNIQUE_ID_LEN: usize = 8;
pub const SDM_FW_BUILD_ID_LEN: usize = 28;
pub const PUBLIC_EFUSE_LEN: usize = 256;

pub const SIGMA_M1_MAGIC: u32 = 0x5349_4D31; // "SIM1"
pub const SIGMA_M2_MAGIC: u32 = 0x5349_4D32; // "SIM2"
pub const SIGMA_M3_MAGIC: u32 = 0x5349_4D33; // "SIM3"
pub const SIGMA_ENC_MAGIC: u32 = 0x5345_4E43; // "SENC"
pub const SIGMA_TEARDOWN_MAGIC: u32 = 0x5354_5244; // "STRD"

/// Session id that addresses every open session on the device.
pub const SDM_SESSION_ID_ALL: u32 = 0xFFFF_FFFF;

fn parse_fixed<T: FromBytes>(bytes: &[u8], name: &str) -> BkpsResult<T> {
    match T::read_from_bytes(bytes) {
        Ok(msg) => Ok(msg),
        Err(_) => raise_err!(
            CODEC_INVALID_LENGTH,
            "{name} should be {} bytes but is {} bytes.",
            size_of::<T>(),
            bytes.len()
        ),
    }
}

fn check_magic(actual: u32, expected: u32, name: &str) -> BkpsResult<()> {
    if actual != expected {
        raise_err!(
            CODEC_INVALID_MAGIC,
            "Invalid magic number in {name}. Expected: 0x{expected:08X}, Actual: 0x{actual:08X}."
        );
    }
    Ok(())
}

/// M1: the service opens a session and offers its ephemeral DH key. The
/// service certificate chain, root first, follows the fixed part.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SigmaM1Message {
    pub reserved_header: u32,
    pub magic: u32,
    pub sdm_session_id: u32,
    pub reserved: u32,
    pub bkps_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
}

impl SigmaM1Message {
    pub fn new(bkps_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN]) -> Self {
        let mut msg = Self::new_zeroed();
        msg.magic = SIGMA_M1_MAGIC;
        msg.bkps_dh_pub_key = bkps_dh_pub_key;
        msg
    }

    pub fn build(&self, service_chain: &[u8]) -> Vec<u8> {
        let mut out = self.as_bytes().to_vec();
        out.extend_from_slice(service_chain);
        out
    }
}

/// M2: device answer carrying its identity, DH key, the echoed service key,
/// a signature by the device attestation key and a MAC under the PMK.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SigmaM2Message {
    pub reserved_header: u32,
    pub magic: u32,
    pub sdm_session_id: u32,
    pub device_unique_id: [u8; DEVICE_UNIQUE_ID_LEN],
    pub rom_version_num: [u8; 4],
    pub sdm_fw_build_id: [u8; SDM_FW_BUILD_ID_LEN],
    pub sdm_fw_security_version_num: [u8; 4],
    pub reserved: u32,
    pub public_efuse_values: [u8; PUBLIC_EFUSE_LEN],
    pub device_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
    pub bkps_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
    pub signature: [u8; SIGMA_SIGNATURE_LEN],
    pub mac: [u8; SIGMA_MAC_LEN],
}

impl SigmaM2Message {
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let msg: Self = parse_fixed(bytes, "SigmaM2Message")?;
        check_magic(msg.magic, SIGMA_M2_MAGIC, "SigmaM2Message")?;
        Ok(msg)
    }

    /// Bytes covered by the device signature.
    pub fn signed_data(&self) -> &[u8] {
        &self.as_bytes()[..offset_of!(Self, signature)]
    }

    /// Bytes covered by the MAC: everything but the MAC itself.
    pub fn mac_data(&self) -> &[u8] {
        &self.as_bytes()[..offset_of!(Self, mac)]
    }

    pub fn rom_version(&self) -> u32 {
        u32::from_le_bytes(self.rom_version_num)
    }

    pub fn sdm_svn(&self) -> u32 {
        u32::from_le_bytes(self.sdm_fw_security_version_num)
    }

    /// Build id as text with trailing NULs removed.
    pub fn sdm_fw_build_id_string(&self) -> String {
        let end = self
            .sdm_fw_build_id
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |p| p + 1);
        String::from_utf8_lossy(&self.sdm_fw_build_id[..end]).into_owned()
    }
}

/// M3: the service proves possession of its signing key and confirms both
/// DH keys.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SigmaM3Message {
    pub reserved_header: u32,
    pub magic: u32,
    pub sdm_session_id: u32,
    pub reserved: u32,
    pub bkps_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
    pub device_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
    pub signature: [u8; SIGMA_SIGNATURE_LEN],
    pub mac: [u8; SIGMA_MAC_LEN],
}

impl SigmaM3Message {
    pub fn new(
        sdm_session_id: u32,
        bkps_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
        device_dh_pub_key: [u8; SIGMA_PUB_KEY_LEN],
    ) -> Self {
        let mut msg = Self::new_zeroed();
        msg.magic = SIGMA_M3_MAGIC;
        msg.sdm_session_id = sdm_session_id;
        msg.bkps_dh_pub_key = bkps_dh_pub_key;
        msg.device_dh_pub_key = device_dh_pub_key;
        msg
    }

    pub fn signed_data(&self) -> &[u8] {
        &self.as_bytes()[..offset_of!(Self, signature)]
    }

    pub fn mac_data(&self) -> &[u8] {
        &self.as_bytes()[..offset_of!(Self, mac)]
    }
}

/// Fixed prefix shared by SIGMA_ENC requests and responses.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SigmaEncHeader {
    pub reserved_header: u32,
    pub magic: u32,
    pub sdm_session_id: u32,
    /// Request counter, or response counter in device answers.
    pub message_counter: u32,
    pub reserved1: u32,
    pub payload_len: u32,
    pub initial_iv: [u8; SIGMA_IV_LEN],
    pub number_of_padding_bytes: u8,
    pub reserved2: [u8; 3],
}

/// SIGMA_ENC message: header, AES-CTR encrypted payload and MAC under the
/// session MAC key over header and ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigmaEncMessage {
    pub header: SigmaEncHeader,
    pub encrypted_payload: Vec<u8>,
    pub mac: [u8; SIGMA_MAC_LEN],
}

impl SigmaEncMessage {
    pub fn new(
        sdm_session_id: u32,
        message_counter: u32,
        initial_iv: [u8; SIGMA_IV_LEN],
        number_of_padding_bytes: u8,
        encrypted_payload: Vec<u8>,
    ) -> Self {
        let mut header = SigmaEncHeader::new_zeroed();
        header.magic = SIGMA_ENC_MAGIC;
        header.sdm_session_id = sdm_session_id;
        header.message_counter = message_counter;
        header.payload_len = encrypted_payload.len() as u32;
        header.initial_iv = initial_iv;
        header.number_of_padding_bytes = number_of_padding_bytes;
        Self {
            header,
            encrypted_payload,
            mac: [0; SIGMA_MAC_LEN],
        }
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let header_len = size_of::<SigmaEncHeader>();
        if bytes.len() < header_len + SIGMA_MAC_LEN {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "SigmaEncMessage should be at least {} bytes but is {} bytes.",
                header_len + SIGMA_MAC_LEN,
                bytes.len()
            );
        }
        let header: SigmaEncHeader = parse_fixed(&bytes[..header_len], "SigmaEncHeader")?;
        check_magic(header.magic, SIGMA_ENC_MAGIC, "SigmaEncMessage")?;
        let payload_len = header.payload_len as usize;
        if bytes.len() != header_len + payload_len + SIGMA_MAC_LEN {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "SigmaEncMessage declares {payload_len} payload bytes but is {} bytes.",
                bytes.len()
            );
        }
        let mut mac = [0u8; SIGMA_MAC_LEN];
        mac.copy_from_slice(&bytes[header_len + payload_len..]);
        Ok(Self {
            header,
            encrypted_payload: bytes[header_len..header_len + payload_len].to_vec(),
            mac,
        })
    }

    /// Bytes covered by the MAC.
    pub fn mac_data(&self) -> Vec<u8> {
        let mut data = self.header.as_bytes().to_vec();
        data.extend_from_slice(&self.encrypted_payload);
        data
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.mac_data();
        out.extend_from_slice(&self.mac);
        out
    }
}

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SigmaTeardownMessage {
    pub reserved_header: u32,
    pub magic: u32,
    pub sdm_session_id: u32,
}

impl SigmaTeardownMessage {
    pub fn new(sdm_session_id: u32) -> Self {
        Self {
            reserved_header: 0,
            magic: SIGMA_TEARDOWN_MAGIC,
            sdm_session_id,
        }
    }
}

/// Teardown acknowledgement. The device may echo the reserved header word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigmaTeardownResponse {
    pub reserved_header: Option<u32>,
}

impl SigmaTeardownResponse {
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        match bytes.len() {
            0 => Ok(Self {
                reserved_header: None,
            }),
            4 => Ok(Self {
                reserved_header: read_u32_le(bytes, 0),
            }),
            len => raise_err!(
                CODEC_INVALID_LENGTH,
                "SigmaTeardownResponse should be empty but is {len} bytes."
            ),
        }
    }
}
