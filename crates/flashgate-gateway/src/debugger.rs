//! Debugger bridge: numbered debug sessions over a spawned debugger
//! process.
//!
//! Each debug session runs the debugger with the programmer attached via a
//! pipe. Inbound `DebuggerLine` requests feed the debugger's stdin; its
//! stdout and stderr stream back to the owning peer as `DebuggerLine`
//! requests with a per-session ordinal.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use flashgate_core::{HandlerError, Requester, Responder, SessionHandle, send_request};
use flashgate_proto::{
    Envelope, Payload, PayloadKind,
    payloads::debugger::{DebuggerLine, DebuggerStart, DebuggerStarted},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

struct DebugSession {
    child: Child,
    stdin_tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct DebuggerState {
    next_debug_id: u64,
    active: HashMap<u64, DebugSession>,
}

/// Manages debug sessions and their process plumbing.
pub struct DebuggerService {
    program: String,
    openocd: String,
    interface_cfg: String,
    boards_dir: PathBuf,
    firmware_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    state: Mutex<DebuggerState>,
}

impl DebuggerService {
    /// Service spawning `program` (a gdb-compatible debugger) wired to
    /// `openocd` for target access.
    pub fn new(
        program: impl Into<String>,
        openocd: impl Into<String>,
        interface_cfg: impl Into<String>,
        boards_dir: impl Into<PathBuf>,
        firmware_dir: impl Into<PathBuf>,
        sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
    ) -> Self {
        Self {
            program: program.into(),
            openocd: openocd.into(),
            interface_cfg: interface_cfg.into(),
            boards_dir: boards_dir.into(),
            firmware_dir: firmware_dir.into(),
            sessions,
            state: Mutex::new(DebuggerState { next_debug_id: 1, active: HashMap::new() }),
        }
    }

    /// Open a debug session for connection `conn_id`; returns its id.
    pub fn start(&self, conn_id: u64, target: &str, firmware: &str) -> Result<u64, HandlerError> {
        let remote = format!(
            "target extended-remote | {} -c \"gdb_port pipe\" -f {} -f {}",
            self.openocd,
            self.interface_cfg,
            self.boards_dir.join(target).display(),
        );

        let mut child = Command::new(&self.program)
            .arg("-ex")
            .arg(remote)
            .arg(self.firmware_dir.join(firmware))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HandlerError::failed)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    let write = async {
                        stdin.write_all(line.as_bytes()).await?;
                        if !line.ends_with('\n') {
                            stdin.write_all(b"\n").await?;
                        }
                        stdin.flush().await
                    };
                    if let Err(error) = write.await {
                        tracing::warn!(%error, "debugger stdin closed");
                        break;
                    }
                }
            });
        }

        let mut state = self.lock();
        let debug_id = state.next_debug_id;
        state.next_debug_id += 1;

        let ordinal = Arc::new(AtomicU64::new(0));
        if let Some(stdout) = stdout {
            self.spawn_line_pump(conn_id, debug_id, stdout, Arc::clone(&ordinal));
        }
        if let Some(stderr) = stderr {
            self.spawn_line_pump(conn_id, debug_id, stderr, ordinal);
        }

        state.active.insert(debug_id, DebugSession { child, stdin_tx });
        tracing::info!(conn_id, debug_id, target, firmware, "debug session started");

        Ok(debug_id)
    }

    /// Close a debug session, killing its process.
    pub fn stop(&self, debug_id: u64) -> Result<(), HandlerError> {
        let mut session = self
            .lock()
            .active
            .remove(&debug_id)
            .ok_or_else(|| HandlerError::Failed(format!("unknown debug session {debug_id}")))?;

        tracing::info!(debug_id, "debug session stopped");
        let _ = session.stdin_tx.send("set confirm off\nquit\n".to_string());
        let _ = session.child.start_kill();
        Ok(())
    }

    /// Forward one command line to a session's debugger stdin.
    pub fn send_line(&self, debug_id: u64, line: String) -> Result<(), HandlerError> {
        let state = self.lock();
        let session = state
            .active
            .get(&debug_id)
            .ok_or_else(|| HandlerError::Failed(format!("unknown debug session {debug_id}")))?;

        session
            .stdin_tx
            .send(line)
            .map_err(|_| HandlerError::Failed("debugger stdin closed".to_string()))
    }

    /// Stream one process output handle back to the peer, line by line.
    fn spawn_line_pump(
        &self,
        conn_id: u64,
        debug_id: u64,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        ordinal: Arc<AtomicU64>,
    ) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let ordinal = ordinal.fetch_add(1, Ordering::SeqCst) + 1;
                let session = {
                    let sessions = match sessions.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    sessions.get(&conn_id).cloned()
                };
                let Some(session) = session else {
                    tracing::debug!(conn_id, debug_id, "no session for debugger line, dropping");
                    continue;
                };

                let push = SendDebuggerLine::new(DebuggerLine { session_id: debug_id, ordinal, line });
                if let Err(error) = send_request(&session, &push).await {
                    tracing::warn!(debug_id, %error, "debugger line push failed");
                }
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, DebuggerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Gateway-initiated debugger output line.
pub struct SendDebuggerLine {
    line: DebuggerLine,
}

impl SendDebuggerLine {
    /// Requester pushing `line`.
    #[must_use]
    pub fn new(line: DebuggerLine) -> Self {
        Self { line }
    }
}

impl Requester for SendDebuggerLine {
    type Response = ();

    fn prepare(&self) -> Payload {
        Payload::DebuggerLine(self.line.clone())
    }

    fn response_kind(&self) -> PayloadKind {
        PayloadKind::Ok
    }

    fn handle_response(&self, _response: Envelope) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Serves `DebuggerStart` for one connection.
pub struct DebuggerStartResponder {
    service: Arc<DebuggerService>,
    conn_id: u64,
}

impl DebuggerStartResponder {
    /// Responder starting sessions owned by connection `conn_id`.
    pub fn new(service: Arc<DebuggerService>, conn_id: u64) -> Self {
        Self { service, conn_id }
    }
}

#[async_trait]
impl Responder for DebuggerStartResponder {
    type Request = DebuggerStart;
    type Response = u64;

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::DebuggerStart
    }

    fn unpack_request(&self, request: &Envelope) -> Result<DebuggerStart, HandlerError> {
        match &request.payload {
            Some(Payload::DebuggerStart(start)) => Ok(start.clone()),
            _ => Err(HandlerError::BadRequest("expected debugger-start payload".to_string())),
        }
    }

    async fn on_request(&self, request: DebuggerStart) -> Result<u64, HandlerError> {
        self.service.start(self.conn_id, &request.target, &request.firmware)
    }

    fn prepare_response(&self, session_id: u64) -> Payload {
        Payload::DebuggerStarted(DebuggerStarted { session_id })
    }
}

/// Serves `DebuggerStop`.
pub struct DebuggerStopResponder {
    service: Arc<DebuggerService>,
}

impl DebuggerStopResponder {
    /// Responder over `service`.
    pub fn new(service: Arc<DebuggerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Responder for DebuggerStopResponder {
    type Request = u64;
    type Response = ();

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::DebuggerStop
    }

    fn unpack_request(&self, request: &Envelope) -> Result<u64, HandlerError> {
        match &request.payload {
            Some(Payload::DebuggerStop(stop)) => Ok(stop.session_id),
            _ => Err(HandlerError::BadRequest("expected debugger-stop payload".to_string())),
        }
    }

    async fn on_request(&self, debug_id: u64) -> Result<(), HandlerError> {
        self.service.stop(debug_id)
    }

    fn prepare_response(&self, (): ()) -> Payload {
        Payload::Ok
    }
}

/// Serves inbound `DebuggerLine` commands.
pub struct DebuggerLineResponder {
    service: Arc<DebuggerService>,
}

impl DebuggerLineResponder {
    /// Responder over `service`.
    pub fn new(service: Arc<DebuggerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Responder for DebuggerLineResponder {
    type Request = DebuggerLine;
    type Response = ();

    fn request_kind(&self) -> PayloadKind {
        PayloadKind::DebuggerLine
    }

    fn unpack_request(&self, request: &Envelope) -> Result<DebuggerLine, HandlerError> {
        match &request.payload {
            Some(Payload::DebuggerLine(line)) => Ok(line.clone()),
            _ => Err(HandlerError::BadRequest("expected debugger-line payload".to_string())),
        }
    }

    async fn on_request(&self, line: DebuggerLine) -> Result<(), HandlerError> {
        self.service.send_line(line.session_id, line.line)
    }

    fn prepare_response(&self, (): ()) -> Payload {
        Payload::Ok
    }
}
