// Licensed under the Apache-2.0 license

//! SPDM 1.2 requester tunnelled through the MCTP mailbox command, and the
//! background service that runs it next to the stateless provisioning
//! round trips.

mod attestation;
mod background;
mod chain;
mod protocol;
mod session;
mod signer;
mod transport;

#[cfg(test)]
pub(crate) mod sim;

pub use attestation::attest_and_start_session;
pub use background::{ProcessResultHolder, SpdmActions, SpdmBackgroundService, SpdmThreadError};
pub use chain::{SlotChain, SpdmCertChain, SpdmChainSearcher, SpdmChainType, SpdmValidChains};
pub use protocol::{SpdmProtocol, SpdmRequester, SUPPORTED_SPDM_VERSION};
pub use session::{SpdmHandshake, SpdmSession};
pub use signer::{
    spdm_signing_data, FinishMessageSigner, FINISH_SIGNING_CONTEXT,
    KEY_EXCHANGE_RSP_SIGNING_CONTEXT, MEASUREMENTS_SIGNING_CONTEXT,
};
pub use transport::{SpdmMessageSender, SpdmTransport};
