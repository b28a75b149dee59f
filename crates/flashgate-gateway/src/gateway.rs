//! Per-connection stack wiring.
//!
//! One peer at a time per pipe: every accepted connection gets its own
//! protocol stack (transport → messenger → session) with a router carrying
//! the full handler set. Stacks live in the session table until their pipe
//! dies; an accepted TCP socket cannot come back, so `Disconnected` is
//! terminal and prunes the stack, leaving the listener to accept the next
//! pipe.
//!
//! The session id of the wire protocol is peer-assigned (`SetSessionId`
//! arrives from the remote and the session adopts it); the connection ids
//! minted here are gateway-internal bookkeeping for status and debugger
//! pushes.

use std::{
    collections::HashMap,
    fs, io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use flashgate_core::{
    ConnectionState, RequestRouter, SessionConfig, SessionHandle, TransportConfig, connect_stack,
    listener::{ListenerClient, TcpGateListener},
    pipe::PipeBuilder,
};

use crate::{
    catalog::{
        CatalogStore, GetBoardsResponder, GetFirmwareResponder, PutBoardsResponder,
        PutFirmwareResponder,
    },
    debugger::{
        DebuggerLineResponder, DebuggerService, DebuggerStartResponder, DebuggerStopResponder,
    },
    flash::{FlashResponder, FlashService},
    upload::{DeleteFileResponder, FileUploadResponder, UploadStore},
};

/// Everything the gateway needs to come up.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the TCP listener binds to.
    pub bind: SocketAddr,
    /// Directory of board configuration files (`*.cfg`).
    pub boards_dir: PathBuf,
    /// Directory of firmware images (also the upload target).
    pub firmware_dir: PathBuf,
    /// Path of the persisted favourites document.
    pub favourites_path: PathBuf,
    /// External programmer command.
    pub flash_program: String,
    /// External debugger command.
    pub debugger_program: String,
    /// Programmer interface configuration passed to the debugger bridge.
    pub openocd_interface: String,
}

/// Shared application services behind the handlers.
pub struct Gateway {
    catalog: Arc<CatalogStore>,
    uploads: Arc<UploadStore>,
    flasher: Arc<FlashService>,
    debugger: Arc<DebuggerService>,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
}

impl Gateway {
    /// Open all stores and services.
    pub fn open(config: &GatewayConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.firmware_dir)?;
        fs::create_dir_all(&config.boards_dir)?;

        let sessions = Arc::new(Mutex::new(HashMap::new()));
        let catalog = Arc::new(CatalogStore::open(
            &config.boards_dir,
            &config.firmware_dir,
            &config.favourites_path,
        )?);
        let uploads = Arc::new(UploadStore::new(&config.firmware_dir));
        let flasher = Arc::new(FlashService::new(
            &config.flash_program,
            &config.boards_dir,
            &config.firmware_dir,
        ));
        let debugger = Arc::new(DebuggerService::new(
            &config.debugger_program,
            &config.flash_program,
            &config.openocd_interface,
            &config.boards_dir,
            &config.firmware_dir,
            Arc::clone(&sessions),
        ));

        Ok(Self { catalog, uploads, flasher, debugger, sessions })
    }

    /// Accept connections on `listener` until it fails.
    pub async fn run(self, listener: TcpGateListener) -> io::Result<()> {
        let client = GatewayClient { gateway: self, next_conn_id: 0 };
        listener.run(client).await
    }

    /// Router with the full handler set for connection `conn_id`.
    fn build_router(&self, conn_id: u64) -> RequestRouter {
        let sessions = Arc::clone(&self.sessions);

        RequestRouter::new()
            .with_responder(GetBoardsResponder::new(Arc::clone(&self.catalog)))
            .with_responder(PutBoardsResponder::new(Arc::clone(&self.catalog)))
            .with_responder(GetFirmwareResponder::new(Arc::clone(&self.catalog)))
            .with_responder(PutFirmwareResponder::new(Arc::clone(&self.catalog)))
            .with_responder(FileUploadResponder::new(Arc::clone(&self.uploads)))
            .with_responder(DeleteFileResponder::new(Arc::clone(&self.uploads)))
            .with_responder(FlashResponder::new(
                Arc::clone(&self.flasher),
                conn_id,
                Arc::clone(&self.sessions),
            ))
            .with_responder(DebuggerStartResponder::new(Arc::clone(&self.debugger), conn_id))
            .with_responder(DebuggerStopResponder::new(Arc::clone(&self.debugger)))
            .with_responder(DebuggerLineResponder::new(Arc::clone(&self.debugger)))
            .with_state_observer(move |state| {
                tracing::info!(conn_id, %state, "connection state changed");
                if state == ConnectionState::Disconnected {
                    let removed = {
                        let mut sessions = match sessions.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        sessions.remove(&conn_id)
                    };
                    if let Some(session) = removed {
                        tracing::info!(conn_id, "pruning dead session stack");
                        session.shutdown();
                    }
                }
            })
    }

    fn attach(&self, conn_id: u64, pipe: Box<dyn PipeBuilder>) {
        let router = self.build_router(conn_id);
        let session = connect_stack(
            pipe,
            Arc::new(router),
            TransportConfig::default(),
            SessionConfig::default(),
        );
        session.reconnect();

        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(conn_id, session);
    }
}

struct GatewayClient {
    gateway: Gateway,
    next_conn_id: u64,
}

#[async_trait]
impl ListenerClient for GatewayClient {
    async fn on_connect(&mut self, pipe: Box<dyn PipeBuilder>, peer: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        tracing::info!(%peer, conn_id, "building session stack");
        self.gateway.attach(conn_id, pipe);
    }
}
