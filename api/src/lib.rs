// Licensed under the Apache-2.0 license

mod header;
mod padding;
mod payload;

pub mod certificate;
pub mod command;
pub mod device;
pub mod mctp;
pub mod message;
pub mod sigma;
pub mod spdm;

pub use bkps_error as error;

pub use certificate::{
    CertificateCommand, CertificateRequestType, CertificateResponse, GetCertificateRequest,
    GetCertificateResponse,
};
pub use command::{CommandId, CommandLayer, ResponseCode};
pub use device::{GetChipIdResponse, GetIdCodeResponse};
pub use header::{CommandHeader, EndiannessActor, COMMAND_HEADER_LEN};
pub use mctp::{MctpMessage, MctpMessageType};
pub use message::{MessageType, ProgrammerMessage, ProgrammerResponse, ProgrammerResponseAdapter};
pub use padding::{pad_to_boundary, padding_len};
pub use payload::{DecryptedPayload, EncryptedPayload, PAYLOAD_MAGIC_NUMBER};

/// Reads a little-endian u32 from `bytes` at `offset`.
pub(crate) fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
