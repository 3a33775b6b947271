//! UDS request dispatch and the reprogramming state machine.
//!
//! Every diagnostic payload (DoIP type 0x8001) lands here. Handlers
//! read and write the NVRAM store, drive the lifecycle state, and for
//! the 0x34/0x36/0x37 sequence stream firmware into the scratch file.
//!
//! Anything malformed, unknown, or out of sequence is answered with the
//! generic DoIP negative acknowledgement (type 0x8002, empty payload);
//! the session itself stays open.

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use vecu_core::digest::sha256_hex_file;
use vecu_core::doip::payload_type;
use vecu_core::state::EcuState;
use vecu_core::uds::{
    self, positive_sid, routine_id, service_id, LENGTH_FORMAT_IDENTIFIER, MAX_BLOCK_LENGTH,
};

use crate::ecu::VirtualEcu;

/// The DoIP frame to send back for a dispatched request.
#[derive(Debug)]
pub struct UdsResponse {
    pub payload_type: u16,
    pub payload: Vec<u8>,
    /// Set on a verified RequestTransferExit: the session must emit the
    /// positive response first and invoke the hot-swap afterwards.
    pub swap_after_send: bool,
}

impl UdsResponse {
    fn negative() -> Self {
        Self {
            payload_type: payload_type::NEGATIVE_ACK,
            payload: Vec::new(),
            swap_after_send: false,
        }
    }

    fn diagnostic(payload: Vec<u8>) -> Self {
        Self {
            payload_type: payload_type::DIAGNOSTIC_MESSAGE,
            payload,
            swap_after_send: false,
        }
    }
}

/// Per-session reprogramming progress.
///
/// Populated by RequestDownload, advanced by TransferData, and cleared
/// by RequestTransferExit whether or not the integrity check passes.
#[derive(Default)]
pub struct TransferSession {
    expected_size: u32,
    bytes_received: u32,
    last_block_counter: u8,
    output: Option<File>,
    /// Whether this session owns the process-wide OTA token.
    token_held: bool,
}

impl TransferSession {
    /// Clear all progress and hand the OTA token back. Called at the
    /// end of the 0x37 handler and on session teardown.
    pub fn reset(&mut self, ecu: &VirtualEcu) {
        self.expected_size = 0;
        self.bytes_received = 0;
        self.last_block_counter = 0;
        self.output = None;
        if std::mem::take(&mut self.token_held) {
            ecu.end_transfer();
        }
    }
}

/// Dispatch one UDS request. `request` is non-empty; the first octet is
/// the service ID.
pub async fn handle_request(
    ecu: &VirtualEcu,
    transfer: &mut TransferSession,
    request: &[u8],
) -> UdsResponse {
    match request[0] {
        service_id::READ_DATA_BY_ID => read_data_by_id(ecu, request),
        service_id::WRITE_DATA_BY_ID => write_data_by_id(ecu, request),
        service_id::ROUTINE_CONTROL => routine_control(ecu, request),
        service_id::REQUEST_DOWNLOAD => request_download(ecu, transfer, request).await,
        service_id::TRANSFER_DATA => transfer_data(ecu, transfer, request).await,
        service_id::REQUEST_TRANSFER_EXIT => request_transfer_exit(ecu, transfer, request).await,
        sid => {
            debug!(service_id = format!("0x{sid:02X}"), "unsupported service");
            UdsResponse::negative()
        }
    }
}

fn read_data_by_id(ecu: &VirtualEcu, request: &[u8]) -> UdsResponse {
    if request.len() < 3 {
        return UdsResponse::negative();
    }
    let did = u16::from_be_bytes([request[1], request[2]]);

    // Reload from disk so writes the application made since the last
    // frame are visible to the tester.
    if let Err(e) = ecu.nvram().load() {
        error!(error = %e, "NVRAM reload failed");
        return UdsResponse::negative();
    }

    let Some(data_id) = uds::lookup(did) else {
        debug!(did = format!("0x{did:04X}"), "unknown DID");
        return UdsResponse::negative();
    };
    let Some(text) = ecu.nvram().get(data_id.key) else {
        debug!(key = data_id.key, "key absent from NVRAM");
        return UdsResponse::negative();
    };
    let Ok(value) = text.parse::<f64>() else {
        warn!(key = data_id.key, value = %text, "unparseable NVRAM value");
        return UdsResponse::negative();
    };

    let byte = data_id.encode(value);
    debug!(did = format!("0x{did:04X}"), value, byte, "read data by identifier");
    UdsResponse::diagnostic(vec![
        positive_sid(service_id::READ_DATA_BY_ID),
        request[1],
        request[2],
        byte,
    ])
}

fn write_data_by_id(ecu: &VirtualEcu, request: &[u8]) -> UdsResponse {
    if request.len() < 4 {
        return UdsResponse::negative();
    }
    let did = u16::from_be_bytes([request[1], request[2]]);
    let raw = request[3];

    let writable = uds::lookup(did).filter(|d| d.writable);
    let Some(data_id) = writable else {
        debug!(did = format!("0x{did:04X}"), "DID unknown or not writable");
        return UdsResponse::negative();
    };

    let text = data_id.raw_to_text(raw);
    info!(did = format!("0x{did:04X}"), key = data_id.key, value = %text, "write data by identifier");
    ecu.nvram().set(data_id.key, &text);

    // A write the ECU cannot persist is not acknowledged.
    if let Err(e) = ecu.nvram().save() {
        error!(error = %e, "NVRAM save failed");
        return UdsResponse::negative();
    }

    UdsResponse::diagnostic(vec![
        positive_sid(service_id::WRITE_DATA_BY_ID),
        request[1],
        request[2],
    ])
}

fn routine_control(ecu: &VirtualEcu, request: &[u8]) -> UdsResponse {
    if request.len() < 4 {
        return UdsResponse::negative();
    }
    let routine = u16::from_be_bytes([request[2], request[3]]);

    if routine == routine_id::ENTER_PROGRAMMING_SESSION {
        info!("entering programming session, transitioning to UPDATE_PENDING");
        ecu.state().store(EcuState::UpdatePending);

        let mut payload = vec![positive_sid(service_id::ROUTINE_CONTROL)];
        payload.extend_from_slice(&request[1..]);
        return UdsResponse::diagnostic(payload);
    }

    debug!(routine = format!("0x{routine:04X}"), "unknown routine");
    UdsResponse::negative()
}

async fn request_download(
    ecu: &VirtualEcu,
    transfer: &mut TransferSession,
    request: &[u8],
) -> UdsResponse {
    if ecu.state().load() != EcuState::UpdatePending {
        debug!("RequestDownload outside programming session");
        return UdsResponse::negative();
    }
    if request.len() < 10 {
        return UdsResponse::negative();
    }

    if !transfer.token_held {
        if !ecu.try_begin_transfer() {
            warn!("RequestDownload denied: another OTA is in flight");
            return UdsResponse::negative();
        }
        transfer.token_held = true;
    }

    let expected_size = u32::from_be_bytes([request[6], request[7], request[8], request[9]]);

    let scratch = &ecu.config().update_scratch;
    let file = match File::create(scratch).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %scratch.display(), error = %e, "cannot open update scratch file");
            return UdsResponse::negative();
        }
    };

    transfer.output = Some(file);
    transfer.expected_size = expected_size;
    transfer.bytes_received = 0;

    info!(expected_size, "download accepted, awaiting transfer blocks");
    let [block_hi, block_lo] = MAX_BLOCK_LENGTH.to_be_bytes();
    UdsResponse::diagnostic(vec![
        positive_sid(service_id::REQUEST_DOWNLOAD),
        LENGTH_FORMAT_IDENTIFIER,
        block_hi,
        block_lo,
    ])
}

async fn transfer_data(
    ecu: &VirtualEcu,
    transfer: &mut TransferSession,
    request: &[u8],
) -> UdsResponse {
    if ecu.state().load() != EcuState::UpdatePending {
        debug!("TransferData outside programming session");
        return UdsResponse::negative();
    }
    let Some(file) = transfer.output.as_mut() else {
        debug!("TransferData with no download in progress");
        return UdsResponse::negative();
    };
    if request.len() < 2 {
        return UdsResponse::negative();
    }

    let block_counter = request[1];
    let data = &request[2..];

    if let Err(e) = file.write_all(data).await {
        error!(error = %e, "failed to append to update scratch file");
        return UdsResponse::negative();
    }

    transfer.bytes_received += data.len() as u32;
    // The tester's counter wraps modulo 256; recorded, not enforced.
    transfer.last_block_counter = block_counter;

    debug!(
        block = block_counter,
        bytes = data.len(),
        received = transfer.bytes_received,
        expected = transfer.expected_size,
        "transfer data block"
    );
    UdsResponse::diagnostic(vec![positive_sid(service_id::TRANSFER_DATA), block_counter])
}

async fn request_transfer_exit(
    ecu: &VirtualEcu,
    transfer: &mut TransferSession,
    request: &[u8],
) -> UdsResponse {
    if ecu.state().load() != EcuState::UpdatePending {
        debug!("RequestTransferExit outside programming session");
        return UdsResponse::negative();
    }
    let Some(mut file) = transfer.output.take() else {
        debug!("RequestTransferExit with no download in progress");
        return UdsResponse::negative();
    };

    if let Err(e) = file.flush().await {
        error!(error = %e, "failed to flush update scratch file");
        transfer.reset(ecu);
        return UdsResponse::negative();
    }
    drop(file);

    let scratch = &ecu.config().update_scratch;
    let computed = match sha256_hex_file(scratch) {
        Ok(digest) => digest,
        Err(e) => {
            error!(path = %scratch.display(), error = %e, "cannot hash update scratch file");
            transfer.reset(ecu);
            return UdsResponse::negative();
        }
    };

    let supplied = &request[1..];
    let verified = supplied == computed.as_bytes();

    if verified {
        info!(
            bytes = transfer.bytes_received,
            last_block = transfer.last_block_counter,
            digest = %computed,
            "firmware integrity verified"
        );
    } else {
        // Scratch file is left in place for post-mortem; the ECU stays
        // in UPDATE_PENDING until the tester starts over.
        warn!(
            computed = %computed,
            supplied = %String::from_utf8_lossy(supplied),
            "firmware integrity check failed"
        );
    }

    transfer.reset(ecu);

    if verified {
        UdsResponse {
            payload_type: payload_type::DIAGNOSTIC_MESSAGE,
            payload: vec![positive_sid(service_id::REQUEST_TRANSFER_EXIT)],
            swap_after_send: true,
        }
    } else {
        UdsResponse::negative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcuConfig;
    use vecu_core::digest::sha256_hex;

    fn ecu_in(dir: &tempfile::TempDir) -> VirtualEcu {
        let ecu = VirtualEcu::new(EcuConfig {
            port: 0,
            nvram_file: dir.path().join("nvram.dat"),
            app_module: dir.path().join("libacc_app.so"),
            update_scratch: dir.path().join("update.bin"),
            cycle_seconds: 2,
        });
        ecu.boot();
        assert_eq!(ecu.state().load(), EcuState::Application);
        ecu
    }

    async fn dispatch(
        ecu: &VirtualEcu,
        transfer: &mut TransferSession,
        request: &[u8],
    ) -> UdsResponse {
        handle_request(ecu, transfer, request).await
    }

    fn assert_negative(response: &UdsResponse) {
        assert_eq!(response.payload_type, payload_type::NEGATIVE_ACK);
        assert!(response.payload.is_empty());
        assert!(!response.swap_after_send);
    }

    #[tokio::test]
    async fn unknown_service_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x10, 0x02]).await;
        assert_negative(&response);
    }

    #[tokio::test]
    async fn read_default_lead_speed() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x22, 0xF1, 0x01]).await;
        assert_eq!(response.payload_type, payload_type::DIAGNOSTIC_MESSAGE);
        assert_eq!(response.payload, vec![0x62, 0xF1, 0x01, 0x41]);
    }

    #[tokio::test]
    async fn read_unknown_did_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x22, 0xBE, 0xEF]).await;
        assert_negative(&response);
    }

    #[tokio::test]
    async fn read_picks_up_external_store_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        // Simulate the application writing between frames.
        std::fs::write(
            &ecu.config().nvram_file,
            "OWN_VEHICLE_SPEED=42.4\n",
        )
        .unwrap();

        let response = dispatch(&ecu, &mut transfer, &[0x22, 0xF1, 0x03]).await;
        assert_eq!(response.payload, vec![0x62, 0xF1, 0x03, 42]);
    }

    #[tokio::test]
    async fn write_then_read_scaled_did() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x2E, 0xD1, 0x01, 0x05]).await;
        assert_eq!(response.payload, vec![0x6E, 0xD1, 0x01]);

        let response = dispatch(&ecu, &mut transfer, &[0x22, 0xD1, 0x01]).await;
        assert_eq!(response.payload, vec![0x62, 0xD1, 0x01, 0x05]);

        // The write hit the disk, not just the in-memory map.
        let content = std::fs::read_to_string(&ecu.config().nvram_file).unwrap();
        assert!(content.contains("ACC_KP=0.5"));
    }

    #[tokio::test]
    async fn write_to_read_only_did_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        // OWN_VEHICLE_SPEED is owned by the application.
        let response = dispatch(&ecu, &mut transfer, &[0x2E, 0xF1, 0x03, 0x10]).await;
        assert_negative(&response);
    }

    #[tokio::test]
    async fn short_write_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x2E, 0xF1, 0x01]).await;
        assert_negative(&response);
    }

    #[tokio::test]
    async fn enter_programming_session_echoes_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x31, 0x01, 0xFF, 0x00]).await;
        assert_eq!(response.payload, vec![0x71, 0x01, 0xFF, 0x00]);
        assert_eq!(ecu.state().load(), EcuState::UpdatePending);
    }

    #[tokio::test]
    async fn unknown_routine_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        let response = dispatch(&ecu, &mut transfer, &[0x31, 0x01, 0x02, 0x03]).await;
        assert_negative(&response);
        assert_eq!(ecu.state().load(), EcuState::Application);
    }

    fn download_request(size: u32) -> Vec<u8> {
        let mut request = vec![0x34, 0x00, 0x44, 0, 0, 0];
        request.extend_from_slice(&size.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn reprogramming_sequence_rejected_outside_programming_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        assert_negative(&dispatch(&ecu, &mut transfer, &download_request(16)).await);
        assert_negative(&dispatch(&ecu, &mut transfer, &[0x36, 0x01, 0xAA]).await);
        assert_negative(&dispatch(&ecu, &mut transfer, &[0x37]).await);
        assert_eq!(ecu.state().load(), EcuState::Application);
    }

    #[tokio::test]
    async fn transfer_data_before_download_is_negative() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        ecu.state().store(EcuState::UpdatePending);
        assert_negative(&dispatch(&ecu, &mut transfer, &[0x36, 0x01, 0xAA]).await);
        assert_negative(&dispatch(&ecu, &mut transfer, &[0x37]).await);
    }

    #[tokio::test]
    async fn happy_path_ota_verifies_and_requests_swap() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();
        let firmware = b"hello world 1234";

        dispatch(&ecu, &mut transfer, &[0x31, 0x01, 0xFF, 0x00]).await;

        let response = dispatch(&ecu, &mut transfer, &download_request(16)).await;
        assert_eq!(response.payload, vec![0x74, 0x20, 0x10, 0x00]);

        let mut block = vec![0x36, 0x01];
        block.extend_from_slice(firmware);
        let response = dispatch(&ecu, &mut transfer, &block).await;
        assert_eq!(response.payload, vec![0x76, 0x01]);

        let mut exit = vec![0x37];
        exit.extend_from_slice(sha256_hex(firmware).as_bytes());
        let response = dispatch(&ecu, &mut transfer, &exit).await;
        assert_eq!(response.payload, vec![0x77]);
        assert!(response.swap_after_send);

        // Scratch file holds exactly the transferred bytes.
        let scratch = std::fs::read(&ecu.config().update_scratch).unwrap();
        assert_eq!(scratch, firmware);

        // The token was released; a fresh sequence can start.
        assert!(ecu.try_begin_transfer());
        ecu.end_transfer();
    }

    #[tokio::test]
    async fn bad_hash_keeps_scratch_and_update_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();
        let firmware = b"hello world 1234";

        dispatch(&ecu, &mut transfer, &[0x31, 0x01, 0xFF, 0x00]).await;
        dispatch(&ecu, &mut transfer, &download_request(16)).await;
        let mut block = vec![0x36, 0x01];
        block.extend_from_slice(firmware);
        dispatch(&ecu, &mut transfer, &block).await;

        let mut digest = sha256_hex(firmware).into_bytes();
        digest[0] = if digest[0] == b'0' { b'1' } else { b'0' };
        let mut exit = vec![0x37];
        exit.extend_from_slice(&digest);
        let response = dispatch(&ecu, &mut transfer, &exit).await;

        assert_negative(&response);
        assert!(ecu.config().update_scratch.exists());
        assert_eq!(ecu.state().load(), EcuState::UpdatePending);
    }

    #[tokio::test]
    async fn concurrent_download_is_refused_while_token_is_held() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut first = TransferSession::default();
        let mut second = TransferSession::default();

        dispatch(&ecu, &mut first, &[0x31, 0x01, 0xFF, 0x00]).await;
        let response = dispatch(&ecu, &mut first, &download_request(16)).await;
        assert_eq!(response.payload[0], 0x74);

        // A second connection may not start its own transfer.
        assert_negative(&dispatch(&ecu, &mut second, &download_request(16)).await);

        // Releasing the first session frees the token.
        first.reset(&ecu);
        let response = dispatch(&ecu, &mut second, &download_request(16)).await;
        assert_eq!(response.payload[0], 0x74);
        second.reset(&ecu);
    }

    #[tokio::test]
    async fn repeated_download_in_same_session_restarts_transfer() {
        let dir = tempfile::TempDir::new().unwrap();
        let ecu = ecu_in(&dir);
        let mut transfer = TransferSession::default();

        dispatch(&ecu, &mut transfer, &[0x31, 0x01, 0xFF, 0x00]).await;
        dispatch(&ecu, &mut transfer, &download_request(16)).await;
        dispatch(&ecu, &mut transfer, &[0x36, 0x01, 0xAA, 0xBB]).await;

        // Starting over truncates the scratch file.
        let response = dispatch(&ecu, &mut transfer, &download_request(8)).await;
        assert_eq!(response.payload[0], 0x74);
        let len = std::fs::metadata(&ecu.config().update_scratch)
            .unwrap()
            .len();
        assert_eq!(len, 0);
        transfer.reset(&ecu);
    }
}
