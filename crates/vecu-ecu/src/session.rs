//! Per-connection diagnostic session.
//!
//! Each accepted socket gets one session task. The loop is strictly
//! sequential: read one frame, dispatch, write at most one response,
//! repeat. Errors never escape the session; the acceptor and the other
//! sessions are unaffected.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, error, info};
use vecu_core::doip::{self, payload_type, Frame};

use crate::ecu::VirtualEcu;
use crate::uds::{self, TransferSession};

pub struct DiagnosticSession {
    stream: TcpStream,
    peer: SocketAddr,
    ecu: Arc<VirtualEcu>,
    transfer: TransferSession,
}

impl DiagnosticSession {
    pub fn new(stream: TcpStream, peer: SocketAddr, ecu: Arc<VirtualEcu>) -> Self {
        Self {
            stream,
            peer,
            ecu,
            transfer: TransferSession::default(),
        }
    }

    /// Drive the session until the peer disconnects or an I/O error
    /// ends it.
    pub async fn run(mut self) {
        loop {
            let frame = match doip::read_frame(&mut self.stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer = %self.peer, "tester disconnected");
                    break;
                }
                Err(e) => {
                    error!(peer = %self.peer, error = %e, "session ended on read error");
                    break;
                }
            };

            if let Err(e) = self.process_frame(frame).await {
                error!(peer = %self.peer, error = %e, "session ended on write error");
                break;
            }
        }

        // Abandon any half-finished transfer so the next tester can
        // start its own OTA.
        self.transfer.reset(&self.ecu);
    }

    async fn process_frame(&mut self, frame: Frame) -> Result<(), doip::FrameError> {
        match frame.payload_type {
            payload_type::VEHICLE_IDENTIFICATION_REQUEST => {
                debug!(peer = %self.peer, "vehicle identification request");
                doip::write_frame(
                    &mut self.stream,
                    payload_type::VEHICLE_ANNOUNCEMENT,
                    doip::VIN,
                )
                .await
            }
            payload_type::DIAGNOSTIC_MESSAGE => {
                if frame.payload.is_empty() {
                    debug!(peer = %self.peer, "empty diagnostic payload, ignoring");
                    return Ok(());
                }

                let response =
                    uds::handle_request(&self.ecu, &mut self.transfer, &frame.payload).await;
                doip::write_frame(&mut self.stream, response.payload_type, &response.payload)
                    .await?;

                // The tester gets its positive transfer-exit response
                // before the module on disk changes.
                if response.swap_after_send {
                    info!(peer = %self.peer, "transfer verified, invoking hot-swap");
                    self.ecu.apply_update();
                }
                Ok(())
            }
            other => {
                debug!(
                    peer = %self.peer,
                    payload_type = format!("0x{other:04X}"),
                    "ignoring unsupported payload type"
                );
                Ok(())
            }
        }
    }
}
