//! End-to-end gateway tests: a real TCP listener, a dialing client stack,
//! and the full handler set behind the router.

use std::{fs, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use flashgate_core::{
    HandlerError, SessionClient, SessionConfig, SessionHandle, TransportConfig, connect_stack,
    listener::TcpGateListener,
    pipe::TcpDialer,
};
use flashgate_gateway::{Gateway, GatewayConfig};
use flashgate_proto::{Envelope, Payload, PayloadKind};

/// Client side of the pair: acknowledges status pushes from the gateway.
struct AckClient;

#[async_trait]
impl SessionClient for AckClient {
    async fn on_request(&self, request: Envelope) -> Result<Payload, HandlerError> {
        match request.kind() {
            Some(PayloadKind::DeviceUpdateStatus | PayloadKind::DebuggerLine) => Ok(Payload::Ok),
            other => Err(HandlerError::Failed(format!("unexpected request: {other:?}"))),
        }
    }
}

struct Fixture {
    _data: tempfile::TempDir,
    client: SessionHandle,
}

async fn start_gateway() -> Fixture {
    let data = tempfile::tempdir().expect("tempdir");
    let boards_dir = data.path().join("boards");
    let firmware_dir = data.path().join("firmware");
    fs::create_dir_all(&boards_dir).expect("boards dir");
    fs::create_dir_all(&firmware_dir).expect("firmware dir");
    fs::write(boards_dir.join("rp2040.cfg"), b"cfg").expect("board file");
    fs::write(firmware_dir.join("blink.elf"), b"elf").expect("firmware file");

    let config = GatewayConfig {
        bind: "127.0.0.1:0".parse::<SocketAddr>().expect("addr"),
        boards_dir,
        firmware_dir,
        favourites_path: data.path().join("favourites.json"),
        // Stand-ins so the flash/debug paths run without real hardware.
        flash_program: "echo".to_string(),
        debugger_program: "cat".to_string(),
        openocd_interface: "interface/raspberrypi-swd.cfg".to_string(),
    };

    let gateway = Gateway::open(&config).expect("gateway open");
    let listener = TcpGateListener::bind(config.bind).await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(gateway.run(listener));

    let client = connect_stack(
        Box::new(TcpDialer::new(addr)),
        Arc::new(AckClient),
        TransportConfig::default(),
        SessionConfig::default(),
    );
    client.reconnect();

    Fixture { _data: data, client }
}

#[tokio::test]
async fn boards_catalog_over_tcp() {
    let fixture = start_gateway().await;

    let response =
        fixture.client.request(Payload::GetBoardsRequest).await.expect("boards response");

    match response.payload {
        Some(Payload::GetBoardsResponse(data)) => {
            assert_eq!(data.all.len(), 1);
            assert_eq!(data.all[0].name, "rp2040.cfg");
            assert!(!data.all[0].favourite);
        },
        other => unreachable!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn flash_request_over_tcp() {
    let fixture = start_gateway().await;

    let request = Payload::FlashRequest(flashgate_proto::payloads::device::FlashRequest {
        board: flashgate_proto::payloads::boards::Board::new("rp2040.cfg", false),
        firmware: flashgate_proto::payloads::firmware::Firmware::new("blink.elf", false),
    });

    let response = fixture.client.request(request).await.expect("flash response");

    match response.payload {
        Some(Payload::FlashResponse(flash)) => {
            // `echo` reflects the programmer arguments back.
            assert!(flash.message.contains("verify reset exit"));
        },
        other => unreachable!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn unhandled_request_gets_error_response() {
    let fixture = start_gateway().await;

    // The gateway never serves responses-as-requests; the router reports a
    // missing responder and the session wraps it as an error payload.
    let response = fixture
        .client
        .request(Payload::Test("not routable".to_string()))
        .await
        .expect("error response");

    match response.payload {
        Some(Payload::Error(info)) => {
            assert!(info.description.contains("missing responder"));
        },
        other => unreachable!("unexpected payload: {other:?}"),
    }
}
