// Licensed under the Apache-2.0 license

use crate::header::{CommandHeader, EndiannessActor, COMMAND_HEADER_LEN};
use crate::padding::pad_to_boundary;
use bkps_error::{raise_err, BkpsResult};
use std::fmt;

const WORD_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub u32);

impl CommandId {
    pub const CERTIFICATE: Self = Self(0x0B);
    pub const GET_IDCODE: Self = Self(0x10);
    pub const GET_CHIPID: Self = Self(0x12);
    pub const VOLATILE_AES_ERASE: Self = Self(0x1A);
    pub const SIGMA_M1: Self = Self(0xD2);
    pub const SIGMA_M3: Self = Self(0xD3);
    pub const SIGMA_ENC: Self = Self(0xD4);
    pub const SIGMA_TEARDOWN: Self = Self(0xD5);
    pub const GET_ATTESTATION_CERTIFICATE: Self = Self(0x181);
    pub const GET_MEASUREMENT: Self = Self(0x183);
    pub const MCTP: Self = Self(0x194);
    pub const GET_DEVICE_IDENTITY: Self = Self(0x500);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::CERTIFICATE => "CERTIFICATE",
            Self::GET_IDCODE => "GET_IDCODE",
            Self::GET_CHIPID => "GET_CHIPID",
            Self::VOLATILE_AES_ERASE => "VOLATILE_AES_ERASE",
            Self::SIGMA_M1 => "SIGMA_M1",
            Self::SIGMA_M3 => "SIGMA_M3",
            Self::SIGMA_ENC => "SIGMA_ENC",
            Self::SIGMA_TEARDOWN => "SIGMA_TEARDOWN",
            Self::GET_ATTESTATION_CERTIFICATE => "GET_ATTESTATION_CERTIFICATE",
            Self::GET_MEASUREMENT => "GET_MEASUREMENT",
            Self::MCTP => "MCTP",
            Self::GET_DEVICE_IDENTITY => "GET_DEVICE_IDENTITY",
            _ => "UNKNOWN",
        }
    }
}

impl From<u32> for CommandId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<CommandId> for u32 {
    fn from(value: CommandId) -> Self {
        value.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.0)
    }
}

/// Status code reported by the secure device manager in the response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: Self = Self(0);
    pub const INVALID_COMMAND: Self = Self(1);
    pub const UNKNOWN_BR: Self = Self(2);
    pub const UNKNOWN_COMMAND: Self = Self(3);
    pub const INVALID_COMMAND_PARAMS: Self = Self(0x04);
    pub const CMD_INVALID_ON_SOURCE: Self = Self(0x06);
    pub const CLIENT_ID_NO_MATCH: Self = Self(0x08);
    pub const INVALID_ADDRESS: Self = Self(0x09);
    pub const AUTHENTICATION_FAIL: Self = Self(0x0A);
    pub const TIMEOUT: Self = Self(0x0B);
    pub const HW_NOT_READY: Self = Self(0x0C);
    pub const HW_ERROR: Self = Self(0x0D);
    pub const NOT_CONFIGURED: Self = Self(0x100);
    pub const DEVICE_BUSY: Self = Self(0x1FF);
    pub const RESPONSE_ERROR: Self = Self(0x3FF);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::OK => "OK",
            Self::INVALID_COMMAND => "INVALID_COMMAND",
            Self::UNKNOWN_BR => "UNKNOWN_BR",
            Self::UNKNOWN_COMMAND => "UNKNOWN_COMMAND",
            Self::INVALID_COMMAND_PARAMS => "INVALID_COMMAND_PARAMS",
            Self::CMD_INVALID_ON_SOURCE => "CMD_INVALID_ON_SOURCE",
            Self::CLIENT_ID_NO_MATCH => "CLIENT_ID_NO_MATCH",
            Self::INVALID_ADDRESS => "INVALID_ADDRESS",
            Self::AUTHENTICATION_FAIL => "AUTHENTICATION_FAIL",
            Self::TIMEOUT => "TIMEOUT",
            Self::HW_NOT_READY => "HW_NOT_READY",
            Self::HW_ERROR => "HW_ERROR",
            Self::NOT_CONFIGURED => "NOT_CONFIGURED",
            Self::DEVICE_BUSY => "DEVICE_BUSY",
            Self::RESPONSE_ERROR => "RESPONSE_ERROR",
            _ => "UNRECOGNIZED",
        }
    }
}

/// Adds and strips the mailbox header around command and response bodies.
pub struct CommandLayer;

impl CommandLayer {
    /// Client id used for every command the service issues.
    pub const CLIENT: u8 = 1;

    /// Frames `body` as a mailbox command. The body is zero padded to a
    /// word boundary and the header carries its length in words.
    pub fn create(body: &[u8], command: CommandId) -> Vec<u8> {
        Self::frame(body, command.0 as u16)
    }

    /// Builds a device response frame carrying `status`. Used by device
    /// simulators and transports that synthesize responses.
    pub fn response(body: &[u8], status: ResponseCode) -> Vec<u8> {
        Self::frame(body, status.0)
    }

    fn frame(body: &[u8], code: u16) -> Vec<u8> {
        let padded = pad_to_boundary(body, WORD_SIZE);
        let header = CommandHeader::new(code, (padded.len() / WORD_SIZE) as u16, Self::CLIENT, 0);
        let mut frame = Vec::with_capacity(COMMAND_HEADER_LEN + padded.len());
        frame.extend_from_slice(&header.encode(EndiannessActor::Firmware));
        frame.extend_from_slice(&padded);
        frame
    }

    /// Strips the header from a device response to `command` and returns
    /// the body. An UNKNOWN_COMMAND status surfaces as
    /// `UNKNOWN_COMMAND_RESPONSE` so callers can treat the feature as
    /// unsupported on the platform.
    pub fn retrieve(response: &[u8], command: CommandId) -> BkpsResult<&[u8]> {
        let header = CommandHeader::decode(response, EndiannessActor::Firmware)?;
        let status = ResponseCode(header.code);
        match status {
            ResponseCode::OK => {}
            ResponseCode::UNKNOWN_COMMAND => {
                log::debug!("Device does not recognize {command}.");
                raise_err!(
                    UNKNOWN_COMMAND_RESPONSE,
                    "Device responded with UNKNOWN_COMMAND to {command}."
                )
            }
            _ => raise_err!(
                CODEC_RESPONSE_ERROR,
                "Device responded to {command} with error status {} (0x{:x}).",
                status.name(),
                status.0
            ),
        }
        let body = &response[COMMAND_HEADER_LEN..];
        let expected = header.arg_len as usize * WORD_SIZE;
        if body.len() < expected {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "Response to {command} declares {expected} bytes but carries {}.",
                body.len()
            );
        }
        Ok(&body[..expected])
    }
}
