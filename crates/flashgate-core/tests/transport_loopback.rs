//! Transport integration tests over in-memory duplex pipes.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use flashgate_core::{
    ConnectionState, TransportError,
    pipe::{AcceptedPipe, BytePipe, PipeBuilder},
    transport::{TransportConfig, TransportEvent, spawn_transport},
};
use flashgate_proto::FrameDecoder;
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::{Mutex, mpsc},
};

/// Dialer over a scripted supply of in-memory pipes; counts attempts.
struct ScriptedDialer {
    pipes: Arc<Mutex<Vec<DuplexStream>>>,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl PipeBuilder for ScriptedDialer {
    async fn connect(&mut self) -> io::Result<Box<dyn BytePipe>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut pipes = self.pipes.lock().await;
        if pipes.is_empty() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no pipe available"));
        }
        Ok(Box::new(pipes.remove(0)))
    }

    fn supports_reconnecting(&self) -> bool {
        true
    }
}

/// Read `count` complete frames from the raw side of a pipe.
async fn read_frames(pipe: &mut DuplexStream, count: usize) -> Vec<Bytes> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 4096];

    while frames.len() < count {
        let n = pipe.read(&mut buf).await.expect("raw read");
        assert_ne!(n, 0, "peer closed early");
        frames.extend(decoder.feed(&buf[..n]));
    }
    frames
}

#[tokio::test(start_paused = true)]
async fn packets_arrive_in_fifo_order() {
    let (near, mut far) = tokio::io::duplex(1 << 16);
    let (transport, _events) =
        spawn_transport(Box::new(AcceptedPipe::new(near)), TransportConfig::default());
    transport.reconnect();

    let packets: Vec<Bytes> =
        (0..10).map(|i| Bytes::from(format!("packet number {i}"))).collect();

    let mut outgoing = Vec::new();
    for packet in &packets {
        outgoing.push(transport.send(packet.clone()));
    }

    // The pipe sees the packets in enqueue order.
    let frames = read_frames(&mut far, packets.len()).await;
    assert_eq!(frames, packets);

    // Completion futures settle, in order.
    for out in outgoing {
        out.done().await.expect("delivery");
    }
    assert_eq!(transport.state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn loopback_echo_returns_every_packet() {
    let (near_a, near_b) = tokio::io::duplex(1 << 16);

    let (transport_a, mut events_a) =
        spawn_transport(Box::new(AcceptedPipe::new(near_a)), TransportConfig::default());
    let (transport_b, mut events_b) =
        spawn_transport(Box::new(AcceptedPipe::new(near_b)), TransportConfig::default());
    transport_a.reconnect();
    transport_b.reconnect();

    // Side B echoes every packet it receives.
    let echo = transport_b.clone();
    tokio::spawn(async move {
        while let Some(event) = events_b.recv().await {
            if let TransportEvent::PacketReceived(packet) = event {
                let _ = echo.send(packet);
            }
        }
    });

    let packets: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("echo {i}"))).collect();
    for packet in &packets {
        transport_a.send(packet.clone());
    }

    let mut received = Vec::new();
    while received.len() < packets.len() {
        match events_a.recv().await.expect("transport alive") {
            TransportEvent::PacketReceived(packet) => received.push(packet),
            TransportEvent::StateChanged(_) | TransportEvent::Error => {},
        }
    }
    assert_eq!(received, packets);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_bounds_retries_and_fails_sends() {
    let attempts = Arc::new(AtomicU32::new(0));
    let builder = ScriptedDialer {
        pipes: Arc::new(Mutex::new(Vec::new())),
        attempts: Arc::clone(&attempts),
    };

    let (transport, _events) = spawn_transport(Box::new(builder), TransportConfig::default());

    let out = transport.send(Bytes::from_static(b"never delivered"));
    let error = out.done().await.expect_err("must fail after retries");
    assert!(matches!(error, TransportError::RetriesExhausted { .. }));

    let made = attempts.load(Ordering::SeqCst);
    assert!((1..=4).contains(&made), "unexpected attempt count {made}");

    // The transport gave up: further sends fail fast with a terminal error.
    let out = transport.send(Bytes::from_static(b"after give-up"));
    let error = out.done().await.expect_err("must fail fast");
    assert!(matches!(error, TransportError::RetriesExhausted { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), made);
}

#[tokio::test(start_paused = true)]
async fn peer_drop_forces_reconnect_cycle() {
    let (pipe1, far1) = tokio::io::duplex(1 << 16);
    let (pipe2, _far2) = tokio::io::duplex(1 << 16);

    let attempts = Arc::new(AtomicU32::new(0));
    let builder = ScriptedDialer {
        pipes: Arc::new(Mutex::new(vec![pipe1, pipe2])),
        attempts: Arc::clone(&attempts),
    };

    let (transport, mut events) = spawn_transport(Box::new(builder), TransportConfig::default());
    transport.reconnect();

    let mut far1 = Some(far1);
    let mut states = Vec::new();
    while states.len() < 5 {
        match events.recv().await.expect("transport alive") {
            TransportEvent::StateChanged(state) => {
                states.push(state);
                if state == ConnectionState::Connected && far1.is_some() {
                    // Peer closes the first pipe after the link comes up.
                    far1 = None;
                }
            },
            TransportEvent::PacketReceived(_) | TransportEvent::Error => {},
        }
    }

    assert_eq!(states, vec![
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
    ]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn accepted_pipe_does_not_reconnect_after_drop() {
    let (near, far) = tokio::io::duplex(1 << 16);
    let (transport, mut events) =
        spawn_transport(Box::new(AcceptedPipe::new(near)), TransportConfig::default());
    transport.reconnect();

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let TransportEvent::StateChanged(state) = event {
                let _ = state_tx.send(state);
            }
        }
    });

    assert_eq!(state_rx.recv().await, Some(ConnectionState::Connecting));
    assert_eq!(state_rx.recv().await, Some(ConnectionState::Connected));

    // Peer hangs up; the single-shot pipe cannot come back.
    drop(far);
    assert_eq!(state_rx.recv().await, Some(ConnectionState::Disconnected));

    // The retry machine tries, discovers the pipe is single-shot, and gives
    // up without reaching Connected again.
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(state) = state_rx.recv().await {
            assert_ne!(state, ConnectionState::Connected, "single-shot pipe reconnected");
        }
    })
    .await
    .expect_err("state stream stays quiet after give-up");
}

#[tokio::test]
async fn oversized_packet_fails_without_connection() {
    let (near, _far) = tokio::io::duplex(64);
    let (transport, _events) =
        spawn_transport(Box::new(AcceptedPipe::new(near)), TransportConfig::default());

    let out = transport.send(Bytes::from(vec![0x42u8; flashgate_proto::MAX_PACKET_LEN + 1]));
    let error = out.done().await.expect_err("oversized packet");
    assert!(matches!(error, TransportError::Protocol(_)));
}
