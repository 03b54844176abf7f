// Licensed under the Apache-2.0 license

use crate::config::SpdmConfig;
use bkps_api::{CommandId, CommandLayer, MctpMessage};
use bkps_error::{raise_err, BkpsError, BkpsResult, ErrorKind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Channel the requester talks to the responder through.
pub trait SpdmTransport: Send + Sync {
    fn send_message(&self, message: MctpMessage);

    /// None when the device does not know the MCTP command.
    fn receive_response(&self) -> BkpsResult<Option<MctpMessage>>;
}

fn lock<T>(mutex: &Mutex<T>) -> BkpsResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| BkpsError::new(ErrorKind::TRANSPORT_FAILURE, "SPDM queue lock is poisoned."))
}

/// Two bounded queues between the SPDM engine thread and the programmer
/// round trips: mailbox commands out, mailbox responses in.
pub struct SpdmMessageSender {
    outbound_tx: SyncSender<Vec<u8>>,
    outbound_rx: Mutex<Receiver<Vec<u8>>>,
    inbound_tx: SyncSender<Vec<u8>>,
    inbound_rx: Mutex<Receiver<Vec<u8>>>,
    response_timeout: Duration,
}

impl SpdmMessageSender {
    pub fn new(config: &SpdmConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::sync_channel(config.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::sync_channel(config.queue_capacity);
        Self {
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            response_timeout: config.response_timeout(),
        }
    }

    /// Waits up to `wait` for the next mailbox command of the engine.
    pub fn next_message(&self, wait: Duration) -> BkpsResult<Option<Vec<u8>>> {
        match lock(&self.outbound_rx)?.recv_timeout(wait) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                raise_err!(TRANSPORT_FAILURE, "SPDM outbound queue is closed.")
            }
        }
    }

    /// Hands a device response to the waiting engine.
    pub fn push_response(&self, response: Vec<u8>) -> BkpsResult<()> {
        match self.inbound_tx.try_send(response) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => raise_err!(
                TRANSPORT_FAILURE,
                "Failed to push SPDM response, previous response was not consumed."
            ),
            Err(TrySendError::Disconnected(_)) => {
                raise_err!(TRANSPORT_FAILURE, "SPDM inbound queue is closed.")
            }
        }
    }

    /// Drops messages left over from a previous task.
    pub fn clear(&self) -> BkpsResult<()> {
        let dropped = lock(&self.outbound_rx)?.try_iter().count() + lock(&self.inbound_rx)?.try_iter().count();
        if dropped > 0 {
            log::debug!("Dropped {dropped} stale SPDM messages.");
        }
        Ok(())
    }
}

impl SpdmTransport for SpdmMessageSender {
    fn send_message(&self, message: MctpMessage) {
        let body = match message.build() {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to encode SPDM message: {e}");
                return;
            }
        };
        let frame = CommandLayer::create(&body, CommandId::MCTP);
        if let Err(e) = self.outbound_tx.try_send(frame) {
            log::error!("Failed to push SPDM message to the queue: {e}");
        }
    }

    fn receive_response(&self) -> BkpsResult<Option<MctpMessage>> {
        let response = match lock(&self.inbound_rx)?.recv_timeout(self.response_timeout) {
            Ok(response) => response,
            Err(_) => raise_err!(TRANSPORT_FAILURE, "No response from SPDM Responder."),
        };
        match CommandLayer::retrieve(&response, CommandId::MCTP) {
            Ok(body) => Ok(Some(MctpMessage::parse(body)?)),
            Err(e) if e.is(ErrorKind::UNKNOWN_COMMAND_RESPONSE) => {
                log::warn!("SPDM is not supported on this platform.");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
