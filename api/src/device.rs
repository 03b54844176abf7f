// Licensed under the Apache-2.0 license

use bkps_error::{raise_err, BkpsResult};

pub const DEVICE_ID_LEN: usize = 8;

/// GET_CHIPID answer. The device unique id is the identity every other
/// provisioning record is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetChipIdResponse {
    pub device_unique_id: [u8; DEVICE_ID_LEN],
}

impl GetChipIdResponse {
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let Some(id) = bytes.get(..DEVICE_ID_LEN) else {
            raise_err!(
                CODEC_INVALID_LENGTH,
                "GetChipIdResponse should be {DEVICE_ID_LEN} bytes but is {} bytes.",
                bytes.len()
            );
        };
        let mut device_unique_id = [0u8; DEVICE_ID_LEN];
        device_unique_id.copy_from_slice(id);
        Ok(Self { device_unique_id })
    }

    /// Lowercase hex form used in logs, certificate subjects and history.
    pub fn device_id(&self) -> String {
        hex::encode(self.device_unique_id)
    }
}

/// GET_IDCODE answer carrying the JTAG IDCODE of the device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetIdCodeResponse {
    pub id_code: u32,
}

impl GetIdCodeResponse {
    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        match crate::read_u32_le(bytes, 0) {
            Some(id_code) => Ok(Self { id_code }),
            None => raise_err!(CODEC_INVALID_LENGTH, "GetIdCodeResponse is too short."),
        }
    }
}
