// Licensed under the Apache-2.0 license

use super::chain::SpdmValidChains;
use super::protocol::SpdmProtocol;
use bkps_crypto::sha384;
use bkps_error::{raise_err, BkpsResult};

/// Reads the signed measurements from the attestation slot, then opens a
/// session keyed to the same slot. The measurement summary the responder
/// signs in KEY_EXCHANGE_RSP must cover exactly the measurements read
/// before. Returns the slot the session runs on.
pub fn attest_and_start_session(
    protocol: &mut dyn SpdmProtocol,
    chains: &SpdmValidChains,
) -> BkpsResult<u8> {
    let Some(slot_id) = chains.attestation_slot() else {
        raise_err!(ATTESTATION_FAILED, "Valid attestation chain not found.");
    };
    log::info!("Verifying device measurements from slot {slot_id}...");
    let measurements = protocol.get_measurements(slot_id)?;
    let blocks = measurements.blocks()?;
    log::debug!("Device reported {} measurement blocks.", blocks.len());

    let summary_hash = protocol.start_session(slot_id)?;
    if summary_hash != sha384(&measurements.measurement_record) {
        raise_err!(
            ATTESTATION_FAILED,
            "Measurement summary hash does not match the device measurements."
        );
    }
    Ok(slot_id)
}
