//! Flashing: drive the external programmer and report progress.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use flashgate_core::{HandlerError, Requester, Responder, SessionHandle, send_request};
use flashgate_proto::{
    Envelope, Payload, PayloadKind,
    payloads::device::{DeviceState, DeviceUpdateStatus, FlashRequest, FlashResponse},
};

/// Runs flash jobs one at a time through the external programmer.
pub struct FlashService {
    program: String,
    boards_dir: PathBuf,
    firmware_dir: PathBuf,
    job: tokio::sync::Mutex<()>,
}

impl FlashService {
    /// Service invoking `program` (an openocd-compatible CLI).
    pub fn new(
        program: impl Into<String>,
        boards_dir: impl Into<PathBuf>,
        firmware_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            boards_dir: boards_dir.into(),
            firmware_dir: firmware_dir.into(),
            job: tokio::sync::Mutex::new(()),
        }
    }

    /// Program `firmware` onto `board`; returns the captured tool output.
    ///
    /// Jobs serialize on an internal lock so two flashes never race for the
    /// programming header.
    pub async fn flash(&self, board: &str, firmware: &str) -> Result<String, HandlerError> {
        let _job = self.job.lock().await;

        let board_cfg = self.boards_dir.join(board);
        let image = self.firmware_dir.join(firmware);
        tracing::info!(board, firmware, "flashing");

        let output = tokio::process::Command::new(&self.program)
            .arg("-f")
            .arg(&board_cfg)
            .arg("-c")
            .arg("transport select swd")
            .arg("-c")
            .arg("targets")
            .arg("-c")
            .arg(format!("program {} verify reset exit", image.display()))
            .output()
            .await
            .map_err(HandlerError::failed)?;

        let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
        message.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            tracing::info!(board, firmware, "flash complete");
            Ok(message)
        } else {
            tracing::error!(board, firmware, status = %output.status, "flash failed");
            Err(HandlerError::Failed(message))
        }
    }
}

/// Serves `FlashRequest`, pushing device status updates to the session that
/// asked.
pub struct FlashResponder {
    service: Arc<FlashService>,
    conn_id: u64,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
}

impl FlashResponder {
    /// Responder pushing status to connection `conn_id`.
    pub fn new(
        service: Arc<FlashService>,
        conn_id: u64,
        sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    ) -> Self {
        Self { service, conn_id, sessions }
    }

    async fn push_status(&self, status: DeviceUpdateStatus) {
        let session = {
            let sessions = match self.sessions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sessions.get(&self.conn_id).cloned()
        };

        if let Some(session) = session {
            if let Err(error) = send_request(&session, &UpdateDeviceStatus::new(status)).await {
                tracing::warn!(%error, "device status push failed");
            }
        }
    }
}

#[async_trait]
impl Responder for FlashResponder {
    type Request = FlashRequest;
    type Response = FlashResponse;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::FlashRequest
    }

    fn unpack_request(&self, request: &Envelope) -> Result<FlashRequest, HandlerError> {
        match &request.payload {
            Some(Payload::FlashRequest(flash)) => Ok(flash.clone()),
            _ => Err(HandlerError::BadRequest("expected flash payload".to_string())),
        }
    }

    async fn on_request(&self, request: FlashRequest) -> Result<FlashResponse, HandlerError> {
        self.push_status(DeviceUpdateStatus {
            status: DeviceState::Flashing,
            flashing_progress: Some(0.0),
            image: Some(request.firmware.name.clone()),
        })
        .await;

        let outcome = self.service.flash(&request.board.name, &request.firmware.name).await;

        let status = match &outcome {
            Ok(_) => DeviceState::Ready,
            Err(_) => DeviceState::Error,
        };
        self.push_status(DeviceUpdateStatus { status, flashing_progress: None, image: None })
            .await;

        outcome.map(|message| FlashResponse { message })
    }

    fn prepare_response(&self, response: FlashResponse) -> Payload {
        Payload::FlashResponse(response)
    }
}

/// Gateway-initiated device status push.
pub struct UpdateDeviceStatus {
    status: DeviceUpdateStatus,
}

impl UpdateDeviceStatus {
    /// Requester announcing `status`.
    #[must_use]
    pub fn new(status: DeviceUpdateStatus) -> Self {
        Self { status }
    }
}

impl Requester for UpdateDeviceStatus {
    type Response = ();

    fn prepare(&self) -> Payload {
        Payload::DeviceUpdateStatus(self.status.clone())
    }

    fn response_kind(&self) -> PayloadKind {
        PayloadKind::Ok
    }

    fn handle_response(&self, _response: Envelope) -> Result<(), HandlerError> {
        Ok(())
    }
}
