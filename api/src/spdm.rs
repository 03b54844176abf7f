// Licensed under the Apache-2.0 license

//! SPDM 1.2 messages exchanged through the MCTP mailbox command. Only the
//! algorithms the service negotiates are modelled: ECDSA P-384, SHA-384,
//! SECP384R1 DHE and AES-256-GCM. Multi-byte integers are little-endian.

use bitflags::bitflags;
use bkps_error::{raise_err, BkpsResult};

pub const SPDM_VERSION_10: u8 = 0x10;
pub const SPDM_VERSION_12: u8 = 0x12;
pub const SPDM_NONCE_LEN: usize = 32;
pub const SPDM_HASH_LEN: usize = 48;
pub const SPDM_SIGNATURE_LEN: usize = 96;
pub const SPDM_DHE_KEY_LEN: usize = 96;
pub const SPDM_MAX_SLOTS: u8 = 8;
pub const SPDM_HEADER_LEN: usize = 4;

pub const BASE_ASYM_ECDSA_P384: u32 = 1 << 7;
pub const BASE_HASH_SHA384: u32 = 1 << 1;
pub const MEASUREMENT_HASH_SHA384: u32 = 1 << 2;
pub const DHE_SECP384R1: u16 = 1 << 4;
pub const AEAD_AES_256_GCM: u16 = 1 << 1;

const MEASUREMENT_SPEC_DMTF: u8 = 0x01;
const ALG_TYPE_DHE: u8 = 2;
const ALG_TYPE_AEAD: u8 = 3;
const ALG_STRUCT_FIXED_COUNT: u8 = 0x20;

/// Little-endian 16-bit length field for `len` bytes of `name`.
pub fn length_u16(len: usize, name: &str) -> BkpsResult<[u8; 2]> {
    match u16::try_from(len) {
        Ok(len) => Ok(len.to_le_bytes()),
        Err(_) => raise_err!(CODEC_INVALID_LENGTH, "{name} of {len} bytes does not fit a 16-bit length."),
    }
}

/// Request all measurement blocks.
pub const MEASUREMENT_OPERATION_ALL: u8 = 0xFF;
/// Ask for the measurement summary hash over all blocks in KEY_EXCHANGE.
pub const MEASUREMENT_SUMMARY_ALL: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpdmCode(pub u8);

impl SpdmCode {
    pub const GET_VERSION: Self = Self(0x84);
    pub const VERSION: Self = Self(0x04);
    pub const GET_CAPABILITIES: Self = Self(0xE1);
    pub const CAPABILITIES: Self = Self(0x61);
    pub const NEGOTIATE_ALGORITHMS: Self = Self(0xE3);
    pub const ALGORITHMS: Self = Self(0x63);
    pub const GET_DIGESTS: Self = Self(0x81);
    pub const DIGESTS: Self = Self(0x01);
    pub const GET_CERTIFICATE: Self = Self(0x82);
    pub const CERTIFICATE: Self = Self(0x02);
    pub const GET_MEASUREMENTS: Self = Self(0xE0);
    pub const MEASUREMENTS: Self = Self(0x60);
    pub const KEY_EXCHANGE: Self = Self(0xE4);
    pub const KEY_EXCHANGE_RSP: Self = Self(0x64);
    pub const FINISH: Self = Self(0xE5);
    pub const FINISH_RSP: Self = Self(0x65);
    pub const END_SESSION: Self = Self(0xEC);
    pub const END_SESSION_ACK: Self = Self(0x6C);
    pub const SET_CERTIFICATE: Self = Self(0xEE);
    pub const SET_CERTIFICATE_RSP: Self = Self(0x6E);
    pub const VENDOR_DEFINED_REQUEST: Self = Self(0xFE);
    pub const VENDOR_DEFINED_RESPONSE: Self = Self(0x7E);
    pub const ERROR: Self = Self(0x7F);

    pub fn name(&self) -> &'static str {
        match *self {
            Self::GET_VERSION => "GET_VERSION",
            Self::VERSION => "VERSION",
            Self::GET_CAPABILITIES => "GET_CAPABILITIES",
            Self::CAPABILITIES => "CAPABILITIES",
            Self::NEGOTIATE_ALGORITHMS => "NEGOTIATE_ALGORITHMS",
            Self::ALGORITHMS => "ALGORITHMS",
            Self::GET_DIGESTS => "GET_DIGESTS",
            Self::DIGESTS => "DIGESTS",
            Self::GET_CERTIFICATE => "GET_CERTIFICATE",
            Self::CERTIFICATE => "CERTIFICATE",
            Self::GET_MEASUREMENTS => "GET_MEASUREMENTS",
            Self::MEASUREMENTS => "MEASUREMENTS",
            Self::KEY_EXCHANGE => "KEY_EXCHANGE",
            Self::KEY_EXCHANGE_RSP => "KEY_EXCHANGE_RSP",
            Self::FINISH => "FINISH",
            Self::FINISH_RSP => "FINISH_RSP",
            Self::END_SESSION => "END_SESSION",
            Self::END_SESSION_ACK => "END_SESSION_ACK",
            Self::SET_CERTIFICATE => "SET_CERTIFICATE",
            Self::SET_CERTIFICATE_RSP => "SET_CERTIFICATE_RSP",
            Self::VENDOR_DEFINED_REQUEST => "VENDOR_DEFINED_REQUEST",
            Self::VENDOR_DEFINED_RESPONSE => "VENDOR_DEFINED_RESPONSE",
            Self::ERROR => "ERROR",
            _ => "UNKNOWN",
        }
    }
}

bitflags! {
    /// CAPABILITIES flags of SPDM 1.2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpdmCapabilities: u32 {
        const CACHE_CAP = 1 << 0;
        const CERT_CAP = 1 << 1;
        const CHAL_CAP = 1 << 2;
        const MEAS_CAP_NO_SIG = 1 << 3;
        const MEAS_CAP_SIG = 1 << 4;
        const MEAS_FRESH_CAP = 1 << 5;
        const ENCRYPT_CAP = 1 << 6;
        const MAC_CAP = 1 << 7;
        const MUT_AUTH_CAP = 1 << 8;
        const KEY_EX_CAP = 1 << 9;
        const PSK_CAP = 1 << 10;
        const ENCAP_CAP = 1 << 12;
        const HBEAT_CAP = 1 << 13;
        const KEY_UPD_CAP = 1 << 14;
        const HANDSHAKE_IN_THE_CLEAR_CAP = 1 << 15;
        const PUB_KEY_ID_CAP = 1 << 16;
        const CHUNK_CAP = 1 << 17;
        const ALIAS_CERT_CAP = 1 << 18;
        const SET_CERT_CAP = 1 << 19;
        const CSR_CAP = 1 << 20;
    }
}

/// Cursor over a received SPDM message.
pub struct SpdmReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    name: &'static str,
}

impl<'a> SpdmReader<'a> {
    pub fn new(bytes: &'a [u8], name: &'static str) -> Self {
        Self { bytes, pos: 0, name }
    }

    pub fn bytes(&mut self, len: usize) -> BkpsResult<&'a [u8]> {
        let Some(chunk) = self.bytes.get(self.pos..self.pos + len) else {
            raise_err!(
                CODEC_BUFFER_TOO_SHORT,
                "{} is truncated at offset {}: {len} more bytes expected, {} left.",
                self.name,
                self.pos,
                self.bytes.len().saturating_sub(self.pos)
            );
        };
        self.pos += len;
        Ok(chunk)
    }

    pub fn array<const N: usize>(&mut self) -> BkpsResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> BkpsResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> BkpsResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u24(&mut self) -> BkpsResult<u32> {
        let b = self.bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn u32(&mut self) -> BkpsResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn skip(&mut self, len: usize) -> BkpsResult<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        self.pos = self.bytes.len();
        rest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdmHeader {
    pub version: u8,
    pub code: SpdmCode,
    pub param1: u8,
    pub param2: u8,
}

impl SpdmHeader {
    pub fn new(code: SpdmCode, param1: u8, param2: u8) -> Self {
        Self {
            version: SPDM_VERSION_12,
            code,
            param1,
            param2,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        vec![self.version, self.code.0, self.param1, self.param2]
    }

    pub fn parse(reader: &mut SpdmReader<'_>) -> BkpsResult<Self> {
        let [version, code, param1, param2] = reader.array()?;
        Ok(Self {
            version,
            code: SpdmCode(code),
            param1,
            param2,
        })
    }

    /// Reads the header of `bytes` and requires `expected` as code. An
    /// ERROR response is reported with its error code.
    pub fn expect(bytes: &[u8], expected: SpdmCode) -> BkpsResult<(Self, SpdmReader<'_>)> {
        let mut reader = SpdmReader::new(bytes, expected.name());
        let header = Self::parse(&mut reader)?;
        if header.code == SpdmCode::ERROR {
            raise_err!(
                SPDM_COMMAND_FAILED,
                "SPDM responder returned error 0x{:02x} (data 0x{:02x}) instead of {}.",
                header.param1,
                header.param2,
                expected.name()
            );
        }
        if header.code != expected {
            raise_err!(
                SPDM_COMMAND_FAILED,
                "Unexpected SPDM message {} (0x{:02x}), expected {}.",
                header.code.name(),
                header.code.0,
                expected.name()
            );
        }
        Ok((header, reader))
    }
}

/// Error codes carried in param1 of an ERROR response.
pub struct SpdmErrorCode;

impl SpdmErrorCode {
    pub const INVALID_REQUEST: u8 = 0x01;
    pub const UNEXPECTED_REQUEST: u8 = 0x04;
    pub const UNSPECIFIED: u8 = 0x05;
    pub const DECRYPT_ERROR: u8 = 0x06;
    pub const UNSUPPORTED_REQUEST: u8 = 0x07;
    pub const VERSION_MISMATCH: u8 = 0x41;
}

pub fn spdm_error(error_code: u8, error_data: u8) -> Vec<u8> {
    SpdmHeader::new(SpdmCode::ERROR, error_code, error_data).build()
}

/// VERSION response listing the supported versions as major/minor bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmVersionResponse {
    pub versions: Vec<u8>,
}

impl SpdmVersionResponse {
    pub fn build(&self) -> Vec<u8> {
        let mut out = SpdmHeader {
            version: SPDM_VERSION_10,
            ..SpdmHeader::new(SpdmCode::VERSION, 0, 0)
        }
        .build();
        out.push(0);
        out.push(self.versions.len() as u8);
        for version in &self.versions {
            out.extend_from_slice(&(u16::from(*version) << 8).to_le_bytes());
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (_, mut reader) = SpdmHeader::expect(bytes, SpdmCode::VERSION)?;
        reader.skip(1)?;
        let count = reader.u8()?;
        let versions = (0..count)
            .map(|_| reader.u16().map(|entry| (entry >> 8) as u8))
            .collect::<BkpsResult<Vec<_>>>()?;
        Ok(Self { versions })
    }
}

pub fn spdm_get_version() -> Vec<u8> {
    SpdmHeader {
        version: SPDM_VERSION_10,
        ..SpdmHeader::new(SpdmCode::GET_VERSION, 0, 0)
    }
    .build()
}

/// Body shared by GET_CAPABILITIES and CAPABILITIES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdmCapabilitiesMessage {
    pub ct_exponent: u8,
    pub flags: SpdmCapabilities,
    pub data_transfer_size: u32,
    pub max_message_size: u32,
}

impl SpdmCapabilitiesMessage {
    pub fn build(&self, code: SpdmCode) -> Vec<u8> {
        let mut out = SpdmHeader::new(code, 0, 0).build();
        out.push(0);
        out.push(self.ct_exponent);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&self.data_transfer_size.to_le_bytes());
        out.extend_from_slice(&self.max_message_size.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8], code: SpdmCode) -> BkpsResult<Self> {
        let (_, mut reader) = SpdmHeader::expect(bytes, code)?;
        reader.skip(1)?;
        let ct_exponent = reader.u8()?;
        reader.skip(2)?;
        Ok(Self {
            ct_exponent,
            flags: SpdmCapabilities::from_bits_retain(reader.u32()?),
            data_transfer_size: reader.u32()?,
            max_message_size: reader.u32()?,
        })
    }
}

/// Algorithm selection of NEGOTIATE_ALGORITHMS and ALGORITHMS. In a
/// request every field is a mask of supported algorithms, in a response a
/// single selected bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdmAlgorithms {
    pub measurement_hash_algo: u32,
    pub base_asym_algo: u32,
    pub base_hash_algo: u32,
    pub dhe: u16,
    pub aead: u16,
}

impl Default for SpdmAlgorithms {
    fn default() -> Self {
        Self {
            measurement_hash_algo: MEASUREMENT_HASH_SHA384,
            base_asym_algo: BASE_ASYM_ECDSA_P384,
            base_hash_algo: BASE_HASH_SHA384,
            dhe: DHE_SECP384R1,
            aead: AEAD_AES_256_GCM,
        }
    }
}

impl SpdmAlgorithms {
    const REQUEST_FIXED_LEN: u16 = 32;
    const RESPONSE_FIXED_LEN: u16 = 36;
    const ALG_STRUCTS: u8 = 2;
    const REQUEST_LEN: u16 = Self::REQUEST_FIXED_LEN + 4 * Self::ALG_STRUCTS as u16;
    const RESPONSE_LEN: u16 = Self::RESPONSE_FIXED_LEN + 4 * Self::ALG_STRUCTS as u16;

    fn push_alg_structs(&self, out: &mut Vec<u8>) {
        for (alg_type, supported) in [(ALG_TYPE_DHE, self.dhe), (ALG_TYPE_AEAD, self.aead)] {
            out.push(alg_type);
            out.push(ALG_STRUCT_FIXED_COUNT);
            out.extend_from_slice(&supported.to_le_bytes());
        }
    }

    fn read_alg_structs(&mut self, reader: &mut SpdmReader<'_>, count: u8) -> BkpsResult<()> {
        for _ in 0..count {
            let alg_type = reader.u8()?;
            let alg_count = reader.u8()?;
            let supported = reader.u16()?;
            reader.skip(usize::from(alg_count & 0x0F) * 4)?;
            match alg_type {
                ALG_TYPE_DHE => self.dhe = supported,
                ALG_TYPE_AEAD => self.aead = supported,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn build_request(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::NEGOTIATE_ALGORITHMS, Self::ALG_STRUCTS, 0).build();
        out.extend_from_slice(&Self::REQUEST_LEN.to_le_bytes());
        out.push(MEASUREMENT_SPEC_DMTF);
        out.push(0);
        out.extend_from_slice(&self.base_asym_algo.to_le_bytes());
        out.extend_from_slice(&self.base_hash_algo.to_le_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(&[0; 4]);
        self.push_alg_structs(&mut out);
        out
    }

    pub fn parse_request(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::NEGOTIATE_ALGORITHMS)?;
        reader.skip(4)?;
        let mut algorithms = Self {
            measurement_hash_algo: 0,
            base_asym_algo: reader.u32()?,
            base_hash_algo: reader.u32()?,
            dhe: 0,
            aead: 0,
        };
        reader.skip(16)?;
        algorithms.read_alg_structs(&mut reader, header.param1)?;
        Ok(algorithms)
    }

    pub fn build_response(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::ALGORITHMS, Self::ALG_STRUCTS, 0).build();
        out.extend_from_slice(&Self::RESPONSE_LEN.to_le_bytes());
        out.push(MEASUREMENT_SPEC_DMTF);
        out.push(0);
        out.extend_from_slice(&self.measurement_hash_algo.to_le_bytes());
        out.extend_from_slice(&self.base_asym_algo.to_le_bytes());
        out.extend_from_slice(&self.base_hash_algo.to_le_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(&[0; 4]);
        self.push_alg_structs(&mut out);
        out
    }

    pub fn parse_response(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::ALGORITHMS)?;
        reader.skip(4)?;
        let mut algorithms = Self {
            measurement_hash_algo: reader.u32()?,
            base_asym_algo: reader.u32()?,
            base_hash_algo: reader.u32()?,
            dhe: 0,
            aead: 0,
        };
        reader.skip(16)?;
        algorithms.read_alg_structs(&mut reader, header.param1)?;
        Ok(algorithms)
    }
}

/// DIGESTS response: one SHA-384 digest per filled certificate slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmDigestsResponse {
    pub slot_mask: u8,
    pub digests: Vec<[u8; SPDM_HASH_LEN]>,
}

impl SpdmDigestsResponse {
    pub fn build(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::DIGESTS, 0, self.slot_mask).build();
        for digest in &self.digests {
            out.extend_from_slice(digest);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::DIGESTS)?;
        let digests = (0..header.param2.count_ones())
            .map(|_| reader.array())
            .collect::<BkpsResult<Vec<_>>>()?;
        Ok(Self {
            slot_mask: header.param2,
            digests,
        })
    }

    /// Slot ids whose bit is set in the mask, ascending.
    pub fn slots(&self) -> Vec<u8> {
        (0..SPDM_MAX_SLOTS)
            .filter(|slot| self.slot_mask & (1 << slot) != 0)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdmGetCertificate {
    pub slot_id: u8,
    pub offset: u16,
    pub length: u16,
}

impl SpdmGetCertificate {
    pub fn build(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::GET_CERTIFICATE, self.slot_id, 0).build();
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::GET_CERTIFICATE)?;
        Ok(Self {
            slot_id: header.param1 & 0x0F,
            offset: reader.u16()?,
            length: reader.u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmCertificateResponse {
    pub slot_id: u8,
    pub portion: Vec<u8>,
    pub remainder_length: u16,
}

impl SpdmCertificateResponse {
    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let mut out = SpdmHeader::new(SpdmCode::CERTIFICATE, self.slot_id, 0).build();
        out.extend_from_slice(&length_u16(self.portion.len(), "Certificate portion")?);
        out.extend_from_slice(&self.remainder_length.to_le_bytes());
        out.extend_from_slice(&self.portion);
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::CERTIFICATE)?;
        let portion_length = reader.u16()?;
        let remainder_length = reader.u16()?;
        Ok(Self {
            slot_id: header.param1 & 0x0F,
            portion: reader.bytes(usize::from(portion_length))?.to_vec(),
            remainder_length,
        })
    }
}

/// GET_MEASUREMENTS asking for all blocks with a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmGetMeasurements {
    pub nonce: [u8; SPDM_NONCE_LEN],
    pub slot_id: u8,
}

impl SpdmGetMeasurements {
    const SIGNATURE_REQUESTED: u8 = 0x01;

    pub fn build(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(
            SpdmCode::GET_MEASUREMENTS,
            Self::SIGNATURE_REQUESTED,
            MEASUREMENT_OPERATION_ALL,
        )
        .build();
        out.extend_from_slice(&self.nonce);
        out.push(self.slot_id);
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (_, mut reader) = SpdmHeader::expect(bytes, SpdmCode::GET_MEASUREMENTS)?;
        Ok(Self {
            nonce: reader.array()?,
            slot_id: reader.u8()? & 0x0F,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmMeasurementsResponse {
    pub slot_id: u8,
    pub number_of_blocks: u8,
    pub measurement_record: Vec<u8>,
    pub nonce: [u8; SPDM_NONCE_LEN],
    pub opaque_data: Vec<u8>,
    pub signature: [u8; SPDM_SIGNATURE_LEN],
}

impl SpdmMeasurementsResponse {
    /// Message bytes covered by the signature.
    pub fn build_unsigned(&self) -> BkpsResult<Vec<u8>> {
        let record_len = match u32::try_from(self.measurement_record.len()) {
            Ok(len) if len <= 0x00FF_FFFF => len,
            _ => raise_err!(
                CODEC_INVALID_LENGTH,
                "Measurement record of {} bytes does not fit a 24-bit length.",
                self.measurement_record.len()
            ),
        };
        let mut out = SpdmHeader::new(SpdmCode::MEASUREMENTS, 0, self.slot_id).build();
        out.push(self.number_of_blocks);
        out.extend_from_slice(&record_len.to_le_bytes()[..3]);
        out.extend_from_slice(&self.measurement_record);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&length_u16(self.opaque_data.len(), "Opaque data")?);
        out.extend_from_slice(&self.opaque_data);
        Ok(out)
    }

    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let mut out = self.build_unsigned()?;
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::MEASUREMENTS)?;
        let number_of_blocks = reader.u8()?;
        let record_len = reader.u24()? as usize;
        let measurement_record = reader.bytes(record_len)?.to_vec();
        let nonce = reader.array()?;
        let opaque_len = reader.u16()?;
        Ok(Self {
            slot_id: header.param2 & 0x0F,
            number_of_blocks,
            measurement_record,
            nonce,
            opaque_data: reader.bytes(usize::from(opaque_len))?.to_vec(),
            signature: reader.array()?,
        })
    }

    pub fn blocks(&self) -> BkpsResult<Vec<SpdmMeasurementBlock>> {
        let mut reader = SpdmReader::new(&self.measurement_record, "MeasurementRecord");
        (0..self.number_of_blocks)
            .map(|_| SpdmMeasurementBlock::read(&mut reader))
            .collect()
    }
}

/// DMTF measurement block: index, spec, then `type | size | value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmMeasurementBlock {
    pub index: u8,
    pub value_type: u8,
    pub value: Vec<u8>,
}

impl SpdmMeasurementBlock {
    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let mut out = vec![self.index, MEASUREMENT_SPEC_DMTF];
        out.extend_from_slice(&length_u16(self.value.len() + 3, "Measurement block")?);
        out.push(self.value_type);
        out.extend_from_slice(&length_u16(self.value.len(), "Measurement value")?);
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    fn read(reader: &mut SpdmReader<'_>) -> BkpsResult<Self> {
        let index = reader.u8()?;
        reader.skip(1)?;
        let size = reader.u16()?;
        let mut inner = SpdmReader::new(reader.bytes(usize::from(size))?, "MeasurementBlock");
        let value_type = inner.u8()?;
        let value_len = inner.u16()?;
        Ok(Self {
            index,
            value_type,
            value: inner.bytes(usize::from(value_len))?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmKeyExchange {
    pub slot_id: u8,
    pub req_session_id: u16,
    pub random: [u8; 32],
    pub exchange_data: [u8; SPDM_DHE_KEY_LEN],
}

impl SpdmKeyExchange {
    pub fn build(&self) -> Vec<u8> {
        let mut out =
            SpdmHeader::new(SpdmCode::KEY_EXCHANGE, MEASUREMENT_SUMMARY_ALL, self.slot_id).build();
        out.extend_from_slice(&self.req_session_id.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.random);
        out.extend_from_slice(&self.exchange_data);
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::KEY_EXCHANGE)?;
        let req_session_id = reader.u16()?;
        reader.skip(2)?;
        Ok(Self {
            slot_id: header.param2,
            req_session_id,
            random: reader.array()?,
            exchange_data: reader.array()?,
        })
    }
}

/// KEY_EXCHANGE_RSP. The measurement summary hash is always present since
/// the request asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmKeyExchangeResponse {
    pub rsp_session_id: u16,
    pub mut_auth_requested: u8,
    pub req_slot_id: u8,
    pub random: [u8; 32],
    pub exchange_data: [u8; SPDM_DHE_KEY_LEN],
    pub measurement_summary_hash: [u8; SPDM_HASH_LEN],
    pub signature: [u8; SPDM_SIGNATURE_LEN],
    pub verify_data: [u8; SPDM_HASH_LEN],
}

impl SpdmKeyExchangeResponse {
    /// Response bytes preceding the signature.
    pub fn build_unsigned(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::KEY_EXCHANGE_RSP, 0, 0).build();
        out.extend_from_slice(&self.rsp_session_id.to_le_bytes());
        out.push(self.mut_auth_requested);
        out.push(self.req_slot_id);
        out.extend_from_slice(&self.random);
        out.extend_from_slice(&self.exchange_data);
        out.extend_from_slice(&self.measurement_summary_hash);
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.build_unsigned();
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.verify_data);
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (_, mut reader) = SpdmHeader::expect(bytes, SpdmCode::KEY_EXCHANGE_RSP)?;
        let rsp_session_id = reader.u16()?;
        let mut_auth_requested = reader.u8()?;
        let req_slot_id = reader.u8()?;
        let random = reader.array()?;
        let exchange_data = reader.array()?;
        let measurement_summary_hash = reader.array()?;
        let opaque_len = reader.u16()?;
        reader.skip(usize::from(opaque_len))?;
        Ok(Self {
            rsp_session_id,
            mut_auth_requested,
            req_slot_id,
            random,
            exchange_data,
            measurement_summary_hash,
            signature: reader.array()?,
            verify_data: reader.array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmFinish {
    pub req_slot_id: u8,
    pub signature: Option<[u8; SPDM_SIGNATURE_LEN]>,
    pub verify_data: [u8; SPDM_HASH_LEN],
}

impl SpdmFinish {
    const SIGNATURE_INCLUDED: u8 = 0x01;

    pub fn header(&self) -> SpdmHeader {
        let param1 = match self.signature {
            Some(_) => Self::SIGNATURE_INCLUDED,
            None => 0,
        };
        SpdmHeader::new(SpdmCode::FINISH, param1, self.req_slot_id)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.header().build();
        if let Some(signature) = &self.signature {
            out.extend_from_slice(signature);
        }
        out.extend_from_slice(&self.verify_data);
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::FINISH)?;
        let signature = match header.param1 & Self::SIGNATURE_INCLUDED {
            0 => None,
            _ => Some(reader.array()?),
        };
        Ok(Self {
            req_slot_id: header.param2,
            signature,
            verify_data: reader.array()?,
        })
    }
}

/// VENDOR_DEFINED_REQUEST and VENDOR_DEFINED_RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmVendorDefined {
    pub standard_id: u16,
    pub vendor_id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl SpdmVendorDefined {
    pub const STANDARD_ID_PCISIG: u16 = 0x0002;
    pub const VENDOR_ID: [u8; 2] = [0xFB, 0x09];

    /// Vendor message addressed to the secure device manager mailbox.
    pub fn mailbox(payload: Vec<u8>) -> Self {
        Self {
            standard_id: Self::STANDARD_ID_PCISIG,
            vendor_id: Self::VENDOR_ID.to_vec(),
            payload,
        }
    }

    pub fn build(&self, code: SpdmCode) -> BkpsResult<Vec<u8>> {
        let Ok(vendor_id_len) = u8::try_from(self.vendor_id.len()) else {
            raise_err!(CODEC_INVALID_LENGTH, "Vendor id of {} bytes is too long.", self.vendor_id.len());
        };
        let mut out = SpdmHeader::new(code, 0, 0).build();
        out.extend_from_slice(&self.standard_id.to_le_bytes());
        out.push(vendor_id_len);
        out.extend_from_slice(&self.vendor_id);
        out.extend_from_slice(&length_u16(self.payload.len(), "Vendor defined payload")?);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn parse(bytes: &[u8], code: SpdmCode) -> BkpsResult<Self> {
        let (_, mut reader) = SpdmHeader::expect(bytes, code)?;
        let standard_id = reader.u16()?;
        let vendor_id_len = reader.u8()?;
        let vendor_id = reader.bytes(usize::from(vendor_id_len))?.to_vec();
        let payload_len = reader.u16()?;
        Ok(Self {
            standard_id,
            vendor_id,
            payload: reader.bytes(usize::from(payload_len))?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmSetCertificate {
    pub slot_id: u8,
    pub cert_chain: Vec<u8>,
}

impl SpdmSetCertificate {
    pub fn build(&self) -> Vec<u8> {
        let mut out = SpdmHeader::new(SpdmCode::SET_CERTIFICATE, self.slot_id & 0x0F, 0).build();
        out.extend_from_slice(&self.cert_chain);
        out
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let (header, mut reader) = SpdmHeader::expect(bytes, SpdmCode::SET_CERTIFICATE)?;
        Ok(Self {
            slot_id: header.param1 & 0x0F,
            cert_chain: reader.rest().to_vec(),
        })
    }
}

/// Record of an established session:
///
/// ```text
/// | session id LE (4) | length LE (2) | AES-256-GCM ciphertext | tag (16) |
/// ```
///
/// The first six bytes are the associated data of the AEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpdmSecuredMessage {
    pub session_id: u32,
    pub sealed: Vec<u8>,
}

impl SpdmSecuredMessage {
    pub const AAD_LEN: usize = 6;

    pub fn aad(session_id: u32, sealed_len: usize) -> BkpsResult<[u8; Self::AAD_LEN]> {
        let mut aad = [0u8; Self::AAD_LEN];
        aad[..4].copy_from_slice(&session_id.to_le_bytes());
        aad[4..].copy_from_slice(&length_u16(sealed_len, "Secured message")?);
        Ok(aad)
    }

    pub fn build(&self) -> BkpsResult<Vec<u8>> {
        let mut out = Self::aad(self.session_id, self.sealed.len())?.to_vec();
        out.extend_from_slice(&self.sealed);
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        let mut reader = SpdmReader::new(bytes, "SpdmSecuredMessage");
        let session_id = reader.u32()?;
        let len = reader.u16()?;
        Ok(Self {
            session_id,
            sealed: reader.bytes(usize::from(len))?.to_vec(),
        })
    }
}
