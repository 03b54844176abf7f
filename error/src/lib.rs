/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the error kinds, error type and macros used by the
    provisioning crates for error handling.

--*/
use std::fmt;
use std::num::{NonZeroU32, TryFromIntError};

/// Provisioning Error Kind
///
/// Every kind carries a unique non-zero numeric code. The upper 16 bits
/// identify the component, the lower 16 bits the failure within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ErrorKind(pub NonZeroU32);

/// Macro to define error constants ensuring uniqueness
///
/// This macro takes a list of (name, value, doc) tuples and generates
/// constant definitions for each error code along with a lookup of the
/// doc string by code.
#[macro_export]
macro_rules! define_error_constants {
    ($(($name:ident, $value:literal, $doc:literal)),* $(,)?) => {
        $(
            #[doc = $doc]
            pub const $name: ErrorKind = ErrorKind::new_const($value);
        )*

        /// Human readable description of the error kind.
        pub fn description(&self) -> &'static str {
            match u32::from(*self) {
                $(
                    $value => $doc,
                )*
                _ => "Unknown error",
            }
        }

        /// Name of the constant the error kind was defined with.
        pub fn name(&self) -> &'static str {
            match u32::from(*self) {
                $(
                    $value => stringify!($name),
                )*
                _ => "UNKNOWN",
            }
        }

        #[cfg(test)]
        /// Returns a vector of all defined error constants for testing uniqueness
        pub fn all_constants() -> Vec<(&'static str, u32)> {
            vec![
                $(
                    (stringify!($name), $value),
                )*
            ]
        }
    };
}

impl ErrorKind {
    /// Create an error kind; intended to only be used from const contexts, as we don't want
    /// runtime panics if val is zero. The preferred way to get an ErrorKind from a u32 is to
    /// use `ErrorKind::try_from()` from the `TryFrom` trait impl.
    const fn new_const(val: u32) -> Self {
        match NonZeroU32::new(val) {
            Some(val) => Self(val),
            None => panic!("ErrorKind cannot be 0"),
        }
    }

    define_error_constants![
        (
            CODEC_BUFFER_TOO_SHORT,
            0x00010001,
            "Buffer too short for the structure"
        ),
        (
            CODEC_RESPONSE_ERROR,
            0x00010002,
            "Device returned an error status"
        ),
        (
            UNKNOWN_COMMAND_RESPONSE,
            0x00010003,
            "Device does not support the command"
        ),
        (
            CODEC_INVALID_MAGIC,
            0x00010004,
            "Invalid magic number"
        ),
        (
            CODEC_INVALID_LENGTH,
            0x00010005,
            "Invalid structure length"
        ),
        (
            CODEC_INVALID_ENCODING,
            0x00010006,
            "Invalid hex or base64 encoding"
        ),
        (
            SIGMA_INTEGRITY_VERIFICATION_FAILED,
            0x00020001,
            "HMAC verification failed."
        ),
        (
            SIGMA_SIGNATURE_VERIFICATION_FAILED,
            0x00020002,
            "Sigma M2 signature verification failed."
        ),
        (
            SIGMA_CONFIGURATION_MISMATCH,
            0x00020003,
            "Service public key echoed by the device does not match"
        ),
        (
            SIGMA_REPLAY_OR_ORDERING_VIOLATION,
            0x00020004,
            "Response counter or IV does not match the session"
        ),
        (
            SIGMA_CONFIGURATION_POLICY_VIOLATION,
            0x00020005,
            "Device attributes violate the service configuration"
        ),
        (
            SIGMA_INVALID_FLOW_STAGE,
            0x00020006,
            "Unexpected flow stage"
        ),
        (
            SIGMA_RESPONSE_COUNT_MISMATCH,
            0x00020007,
            "Unexpected number of programmer responses"
        ),
        (
            SIGMA_KEY_DERIVATION_FAILED,
            0x00020008,
            "Session key derivation failed"
        ),
        (
            DEVICE_CHAIN_VERIFICATION_FAILED,
            0x00030001,
            "Device certificate chain verification failed"
        ),
        (
            CERTIFICATE_REQUEST_TYPE_MISMATCH,
            0x00030002,
            "Certificate type in response does not match the request"
        ),
        (CRL_NOT_FOUND, 0x00030003, "CRL not found"),
        (
            CHAIN_DOWNLOAD_FAILED,
            0x00030004,
            "Failed to download at least one full chain (EFUSE or IID UDS)."
        ),
        (
            CERTIFICATE_PARSE_FAILED,
            0x00030005,
            "Failed to parse certificate"
        ),
        (
            UNSUPPORTED_ALGORITHM,
            0x00040001,
            "Requested algorithm not supported"
        ),
        (
            ATTESTATION_FAILED,
            0x00040002,
            "Valid attestation chain not found."
        ),
        (
            TRANSPORT_FAILURE,
            0x00040003,
            "No response from SPDM Responder."
        ),
        (
            CAPABILITY_UNSUPPORTED,
            0x00040004,
            "Responder does not support the required capability"
        ),
        (
            SPDM_NOT_SUPPORTED,
            0x00040005,
            "SPDM is not supported by the device"
        ),
        (
            SPDM_UNSUPPORTED_VERSION,
            0x00040006,
            "Unsupported SPDM version"
        ),
        (
            SPDM_PROCESS_STILL_RUNNING,
            0x00040007,
            "SPDM process is still running"
        ),
        (
            SPDM_MESSAGE_QUEUE_EMPTY,
            0x00040008,
            "No message available in the queue"
        ),
        (
            SPDM_COMMAND_FAILED,
            0x00040009,
            "SPDM command failed"
        ),
        (
            SEALING_KEY_ROTATION_FAILED,
            0x00050001,
            "Exception occurred during Sealing Key rotation."
        ),
        (
            SEALING_KEY_BACKUP_HASH_DOES_NOT_EXIST,
            0x00050002,
            "Sealing key backup hash does not exist."
        ),
        (
            SEALING_KEY_BACKUP_HASH_DOES_NOT_MATCH,
            0x00050003,
            "Sealing key backup hash does not match."
        ),
        (
            SEALING_KEY_DOES_NOT_EXIST,
            0x00050004,
            "Sealing key does not exist."
        ),
        (
            SEALING_KEY_ROTATION_PENDING,
            0x00050005,
            "Sealing key rotation is pending."
        ),
        (
            SEALING_KEY_ALREADY_EXISTS,
            0x00050006,
            "Active sealing key already exists."
        ),
        (
            SEALING_KEY_INVALID_TRANSITION,
            0x00050007,
            "Invalid sealing key status transition"
        ),
        (
            SEALING_KEY_BACKUP_FAILED,
            0x00050008,
            "Sealing key backup failed."
        ),
        (
            SEALING_KEY_RESTORE_FAILED,
            0x00050009,
            "Sealing key restore failed."
        ),
        (ENCLAVE_FAILURE, 0x00060001, "Security enclave operation failed"),
        (
            ENCLAVE_OBJECT_NOT_FOUND,
            0x00060002,
            "Security object does not exist in the enclave"
        ),
        (CRYPTO_FAILURE, 0x00060003, "Cryptographic operation failed"),
        (
            CONTEXT_ENCRYPTION_FAILED,
            0x00060004,
            "Failed to encrypt provisioning context"
        ),
        (
            CONTEXT_DECRYPTION_FAILED,
            0x00060005,
            "Failed to decrypt provisioning context"
        ),
        (
            CONTEXT_SERIALIZATION_FAILED,
            0x00060006,
            "Failed to (de)serialize provisioning context"
        ),
        (
            PROVISIONING_GENERIC,
            0x00070001,
            "Provisioning failed"
        ),
        (
            OVERBUILD_EXCEEDED,
            0x00070002,
            "Overbuild counter exceeded"
        ),
        (
            CONFIGURATION_NOT_FOUND,
            0x00070003,
            "Service configuration not found"
        ),
        (
            PROGRAMMER_COMMAND_UNSUPPORTED,
            0x00070004,
            "Programmer does not support a required message type"
        ),
        (
            UNKNOWN_PROTOCOL_TYPE,
            0x00070005,
            "Provisioning protocol could not be determined"
        ),
    ];
}

impl From<NonZeroU32> for ErrorKind {
    fn from(val: NonZeroU32) -> Self {
        ErrorKind(val)
    }
}

impl From<ErrorKind> for NonZeroU32 {
    fn from(val: ErrorKind) -> Self {
        val.0
    }
}

impl From<ErrorKind> for u32 {
    fn from(val: ErrorKind) -> Self {
        val.0.get()
    }
}

impl TryFrom<u32> for ErrorKind {
    type Error = TryFromIntError;
    fn try_from(val: u32) -> Result<Self, TryFromIntError> {
        match NonZeroU32::try_from(val) {
            Ok(val) => Ok(ErrorKind(val)),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self.name(), self.0.get())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Provisioning Error
///
/// Carries the error kind, a message naming the failed check and the
/// underlying cause if one exists.
#[derive(Debug)]
pub struct BkpsError {
    kind: ErrorKind,
    message: String,
    source: Option<Cause>,
}

impl BkpsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<Cause>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the error or any error in its source chain is of `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if let Some(err) = err.downcast_ref::<BkpsError>() {
                if err.kind == kind {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

impl From<ErrorKind> for BkpsError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.description())
    }
}

impl fmt::Display for BkpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BkpsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

pub type BkpsResult<T> = Result<T, BkpsError>;

/// Returns early with an error of the given kind.
///
/// `raise_err!(KIND)` uses the kind's description as message,
/// `raise_err!(KIND, "fmt", args..)` formats a specific message.
#[macro_export]
macro_rules! raise_err {
    ($kind:ident) => {
        return Err($crate::BkpsError::from($crate::ErrorKind::$kind))
    };
    ($kind:ident, $($arg:tt)+) => {
        return Err($crate::BkpsError::new(
            $crate::ErrorKind::$kind,
            format!($($arg)+),
        ))
    };
}
