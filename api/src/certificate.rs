// Licensed under the Apache-2.0 license

//! GET_ATTESTATION_CERTIFICATE request/response and the CERTIFICATE command
//! that carries the customer AES key to the device.

use crate::read_u32_le;
use bkps_error::{raise_err, BkpsResult};
use std::fmt;

/// Certificate selector of a GET_ATTESTATION_CERTIFICATE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificateRequestType(pub u32);

impl CertificateRequestType {
    pub const FIRMWARE: Self = Self(0x01);
    pub const DEVICE_ID_ENROLLMENT: Self = Self(0x04);
    pub const UDS_IID_PUF_BKP: Self = Self(0x08);
    pub const UDS_EFUSE_BKP: Self = Self(0x10);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::FIRMWARE => "FIRMWARE",
            Self::DEVICE_ID_ENROLLMENT => "DEVICE_ID_ENROLLMENT",
            Self::UDS_IID_PUF_BKP => "UDS_IID_PUF_BKP",
            Self::UDS_EFUSE_BKP => "UDS_EFUSE_BKP",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for CertificateRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetCertificateRequest {
    pub certificate_type: CertificateRequestType,
}

impl GetCertificateRequest {
    pub fn new(certificate_type: CertificateRequestType) -> Self {
        Self { certificate_type }
    }

    pub fn build(&self) -> Vec<u8> {
        self.certificate_type.0.to_le_bytes().to_vec()
    }
}

/// Device answer: echoed certificate type then the DER certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateResponse {
    pub certificate_type: CertificateRequestType,
    pub certificate_blob: Vec<u8>,
}

impl GetCertificateResponse {
    pub fn new(certificate_type: CertificateRequestType, certificate_blob: Vec<u8>) -> Self {
        Self {
            certificate_type,
            certificate_blob,
        }
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let Some(certificate_type) = read_u32_le(bytes, 0) else {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "GetCertificateResponse should be at least 4 bytes but is {} bytes.",
                bytes.len()
            );
        };
        Ok(Self {
            certificate_type: CertificateRequestType(certificate_type),
            certificate_blob: bytes[4..].to_vec(),
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.certificate_type.0.to_le_bytes().to_vec();
        out.extend_from_slice(&self.certificate_blob);
        out
    }
}

const TEST_PROGRAM_FLAG: u32 = 1;

/// CERTIFICATE command body: flags word followed by the wrapped AES key
/// certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateCommand {
    pub test_program: bool,
    pub aes_key_certificate: Vec<u8>,
}

impl CertificateCommand {
    pub fn new(aes_key_certificate: Vec<u8>, test_program: bool) -> Self {
        Self {
            test_program,
            aes_key_certificate,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let flags = if self.test_program { TEST_PROGRAM_FLAG } else { 0 };
        let mut out = flags.to_le_bytes().to_vec();
        out.extend_from_slice(&self.aes_key_certificate);
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let Some(flags) = read_u32_le(bytes, 0) else {
            raise_err!(CODEC_INVALID_LENGTH, "CERTIFICATE command is missing flags word.");
        };
        Ok(Self {
            test_program: flags & TEST_PROGRAM_FLAG != 0,
            aes_key_certificate: bytes[4..].to_vec(),
        })
    }
}

/// CERTIFICATE command status followed by optional response data. A zero
/// status word means the device finished processing the certificate. For
/// PUF based storage the response data carries the wrapped key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResponse {
    pub status: u32,
    pub response_data: Vec<u8>,
}

impl CertificateResponse {
    pub const PROCESS_COMPLETED: u32 = 0;

    pub fn new(status: u32, response_data: Vec<u8>) -> Self {
        Self {
            status,
            response_data,
        }
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        match read_u32_le(bytes, 0) {
            Some(status) => Ok(Self {
                status,
                response_data: bytes[4..].to_vec(),
            }),
            None => raise_err!(
                CODEC_INVALID_LENGTH,
                "CertificateResponse should be at least 4 bytes but is {} bytes.",
                bytes.len()
            ),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.status.to_le_bytes().to_vec();
        out.extend_from_slice(&self.response_data);
        out
    }

    pub fn process_completed(&self) -> bool {
        self.status == Self::PROCESS_COMPLETED
    }
}
