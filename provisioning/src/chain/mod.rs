// Licensed under the Apache-2.0 license

//! Device certificate chains: distribution point download, assembly and
//! verification.

mod creator;
mod crl;
mod dp;
mod fetch;
mod verifier;
pub mod x509;

pub use creator::{CertificateChainCreator, EnrollmentFlowDetector};
pub use crl::{CrlProvider, PrePopulatedCrlProvider};
pub use dp::{
    CacheFetcher, CacheObject, DistributionPoint, DpCertificate, DpCrl, InMemoryDistributionPoint,
    MirrorDistributionPoint,
};
pub use fetch::{
    ChainFetcher, CrlFetcher, DiceDpFetchService, DistributionPointAddressProvider, DpChainData,
    IidFlowDetector, S10DpFetchService,
};
pub use verifier::{
    CertificateChainDto, CertificateChainVerifier, ChainVerificationPolicy, ChainVerifier,
    DiceBkpPolicy, RootHashVerifier, S10BkpPolicy, KEY_PURPOSE_ATTEST_INIT, KEY_PURPOSE_BKP,
};
