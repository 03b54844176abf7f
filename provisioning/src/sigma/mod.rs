// Licensed under the Apache-2.0 license

//! SIGMA key exchange with the device secure manager and the encrypted
//! channel that carries the AES key certificate.

mod enc;
mod flow;
mod identity;
mod keys;
mod verify;

pub use enc::SigmaEncCodec;
pub use flow::SigmaFlow;
pub use identity::ServiceIdentity;
pub use keys::{SessionKeys, SEK_LEN};
pub use verify::{
    verify_all, SigmaEncIntegrityVerifier, SigmaEncResponseCounterIvVerifier,
    SigmaM2BkpsPubKeyVerifier, SigmaM2IntegrityVerifier, SigmaM2SignatureVerifier,
    SigmaM2WithServiceCfgVerifier, SigmaVerifier,
};

#[cfg(test)]
pub(crate) use identity::test_identity;
