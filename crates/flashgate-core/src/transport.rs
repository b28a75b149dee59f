//! Packet transport over a byte pipe.
//!
//! The transport owns a [`PipeBuilder`](crate::pipe::PipeBuilder), frames
//! outgoing packets with the zero-insertion codec, decodes inbound frames,
//! and keeps the connection alive through a bounded retry machine. Public
//! operations are non-blocking: [`TransportHandle::send`] enqueues and
//! returns an [`OutgoingPacket`] whose future settles on delivery or after
//! retry exhaustion.
//!
//! Two pieces cooperate here:
//!
//! - the *transport actor*: the send queue (one packet in flight at a time,
//!   FIFO), the `error_count`/`been_connected` retry state machine, and the
//!   guarded scheduling of reconnect attempts;
//! - the *link*: pipe setup plus a reader task (frame decode, hangup
//!   detection) and a writer task (frame encode, per-packet completion),
//!   both reporting back into the actor's mailbox.
//!
//! Ordering holds within one connection lifetime only; each reconnect is a
//! fresh channel and callers must treat it as such.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    time::Duration,
};

use flashgate_proto::{FrameDecoder, MAX_PACKET_LEN, encode_frame};

use crate::{
    actor::{GuardSet, Inbox, MailboxSender, mailbox},
    connection::ConnectionState,
    error::TransportError,
    pipe::PipeBuilder,
};

/// Spacing between reconnect attempts.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive errors tolerated before the transport gives up on the
/// head-of-queue packet.
pub const MAX_ERROR_COUNT: u32 = 4;

const TASK_GUARD: &str = "transport_task";
const RECONNECT_GUARD: &str = "reconnect";

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Spacing between retry-machine steps and reconnect attempts.
    pub reconnect_timeout: Duration,
    /// Error budget for one head-of-queue packet.
    pub max_error_count: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { reconnect_timeout: RECONNECT_TIMEOUT, max_error_count: MAX_ERROR_COUNT }
    }
}

/// Events a transport delivers to the layer above.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound packet (frame payload).
    PacketReceived(Bytes),
    /// The connection state changed; duplicates are already suppressed.
    StateChanged(ConnectionState),
    /// A recoverable I/O error occurred; the retry machinery is handling it.
    Error,
}

/// Handle to an enqueued packet.
///
/// The future settles exactly once: `Ok` when the packet was written to the
/// pipe, `Err` when the transport gave up on it.
#[derive(Debug)]
pub struct OutgoingPacket {
    packet: Bytes,
    done: oneshot::Receiver<Result<(), TransportError>>,
}

impl OutgoingPacket {
    pub(crate) fn new(
        packet: Bytes,
        done: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Self {
        Self { packet, done }
    }

    /// The packet bytes this handle tracks.
    #[must_use]
    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    /// Wait for delivery or a terminal error.
    pub async fn done(self) -> Result<(), TransportError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }
}

pub(crate) enum TransportCmd {
    Send { packet: Bytes, done: oneshot::Sender<Result<(), TransportError>> },
    Reconnect,
    Disconnect,
    Task,
    QueryState(oneshot::Sender<ConnectionState>),
    QueryReconnectable(oneshot::Sender<bool>),
    Link(LinkEvent),
    HeadDone { generation: u64, result: Result<(), TransportError> },
}

pub(crate) enum LinkEvent {
    Packet(Bytes),
    Hangup,
    ReadError(String),
    WriteError(String),
}

/// Cloneable handle to a running transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: MailboxSender<TransportCmd>,
}

impl TransportHandle {
    pub(crate) fn from_sender(tx: MailboxSender<TransportCmd>) -> Self {
        Self { tx }
    }

    /// Enqueue a packet for delivery. FIFO order is preserved.
    pub fn send(&self, packet: Bytes) -> OutgoingPacket {
        let (done_tx, done_rx) = oneshot::channel();
        let out = OutgoingPacket::new(packet.clone(), done_rx);

        if let Err(TransportCmd::Send { done, .. }) =
            self.tx.try_send(TransportCmd::Send { packet, done: done_tx })
        {
            let _ = done.send(Err(TransportError::Closed));
        }

        out
    }

    /// Request a transition to `Connected`.
    pub fn reconnect(&self) {
        self.tx.send(TransportCmd::Reconnect);
    }

    /// Request a transition to `Disconnected`.
    pub fn disconnect(&self) {
        self.tx.send(TransportCmd::Disconnect);
    }

    /// Current connection state; `Disconnected` if the transport is gone.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if !self.tx.send(TransportCmd::QueryState(tx)) {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }

    /// Whether the underlying pipe can be re-opened after a drop.
    pub async fn supports_reconnecting(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if !self.tx.send(TransportCmd::QueryReconnectable(tx)) {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Spawn a transport over `builder`.
///
/// Returns the command handle and the event stream for the layer above. The
/// transport starts `Disconnected`; call [`TransportHandle::reconnect`] (or
/// just `send`, the retry machine dials on demand) to bring it up. The
/// actor winds down when every handle has dropped.
pub fn spawn_transport(
    builder: Box<dyn PipeBuilder>,
    config: TransportConfig,
) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
    let (handle_tx, inbox) = mailbox();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let link = Link::new(builder, inbox.internal_sender());
    let actor = TransportActor {
        config,
        events: events_tx,
        link,
        state: ConnectionState::Disconnected,
        queue: VecDeque::new(),
        error_count: 0,
        been_connected: false,
        head_generation: 0,
        last_error: None,
        guards: GuardSet::default(),
        inbox,
    };

    tokio::spawn(actor.run());

    (TransportHandle::from_sender(handle_tx), events_rx)
}

struct QueuedPacket {
    packet: Bytes,
    done: Option<oneshot::Sender<Result<(), TransportError>>>,
    pending: bool,
}

impl QueuedPacket {
    fn settle(mut self, result: Result<(), TransportError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

struct TransportActor {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Link,
    state: ConnectionState,
    queue: VecDeque<QueuedPacket>,
    error_count: u32,
    been_connected: bool,
    head_generation: u64,
    last_error: Option<String>,
    guards: GuardSet,
    inbox: Inbox<TransportCmd>,
}

impl TransportActor {
    async fn run(mut self) {
        while let Some(cmd) = self.inbox.recv().await {
            self.handle(cmd).await;
        }

        self.link.shutdown();
        for packet in self.queue.drain(..) {
            packet.settle(Err(TransportError::Closed));
        }
    }

    async fn handle(&mut self, cmd: TransportCmd) {
        match cmd {
            TransportCmd::Send { packet, done } => {
                if packet.len() > MAX_PACKET_LEN {
                    let _ = done.send(Err(TransportError::Protocol(
                        flashgate_proto::ProtocolError::PacketTooLarge {
                            len: packet.len(),
                            max: MAX_PACKET_LEN,
                        },
                    )));
                    return;
                }

                tracing::debug!(pending = self.queue.len(), "enqueueing packet");
                self.queue.push_back(QueuedPacket { packet, done: Some(done), pending: false });

                // A scheduled reconnect will pump once the link is back.
                if !self.guards.is_pending(RECONNECT_GUARD) {
                    self.transport_task();
                }
            },

            TransportCmd::Reconnect => {
                self.guards.release(RECONNECT_GUARD);
                self.do_reconnect().await;
            },

            TransportCmd::Disconnect => self.do_disconnect(),

            TransportCmd::Task => {
                self.guards.release(TASK_GUARD);
                self.transport_task();
            },

            TransportCmd::QueryState(tx) => {
                let _ = tx.send(self.state);
            },

            TransportCmd::QueryReconnectable(tx) => {
                let _ = tx.send(self.link.supports_reconnecting());
            },

            TransportCmd::Link(event) => self.handle_link_event(event),

            TransportCmd::HeadDone { generation, result } => {
                self.handle_head_done(generation, result);
            },
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Packet(packet) => {
                tracing::debug!(len = packet.len(), "packet received");
                let _ = self.events.send(TransportEvent::PacketReceived(packet));
            },
            LinkEvent::Hangup => {
                tracing::debug!("peer hung up");
                self.link.shutdown();
                self.set_state(ConnectionState::Disconnected);
                self.transport_task();
            },
            LinkEvent::ReadError(reason) => {
                tracing::warn!(%reason, "read failed");
                self.last_error = Some(reason);
                self.error_count += 1;
                self.link.shutdown();
                self.set_state(ConnectionState::Error);
                let _ = self.events.send(TransportEvent::Error);
                self.transport_task();
            },
            LinkEvent::WriteError(reason) => {
                tracing::warn!(%reason, "write failed");
                self.last_error = Some(reason);
                self.link.shutdown();
                self.set_state(ConnectionState::Error);
                let _ = self.events.send(TransportEvent::Error);
                self.transport_task();
            },
        }
    }

    /// Completion of the in-flight head-of-queue write.
    ///
    /// The generation marker rejects completions from a superseded attempt,
    /// so a zombie notification can never pop a packet it did not carry.
    fn handle_head_done(&mut self, generation: u64, result: Result<(), TransportError>) {
        if generation != self.head_generation {
            tracing::debug!("stale head completion, ignoring");
            return;
        }

        match result {
            Ok(()) => {
                tracing::debug!("packet delivered");
                if let Some(head) = self.queue.pop_front() {
                    head.settle(Ok(()));
                }
                self.error_count = 0;
                self.transport_task();
            },
            Err(error) => {
                tracing::warn!(%error, "packet delivery failed");
                self.last_error = Some(error.to_string());
                self.error_count += 1;
                if let Some(head) = self.queue.front_mut() {
                    head.pending = false;
                }
                if self.error_count > self.config.max_error_count {
                    tracing::error!(%error, "giving up on head-of-queue packet");
                    if let Some(head) = self.queue.pop_front() {
                        head.settle(Err(error));
                    }
                }
                self.transport_task();
            },
        }
    }

    /// Retry state machine, per current state.
    fn transport_task(&mut self) {
        tracing::debug!(state = %self.state, "transport task");
        match self.state {
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                self.schedule_task(self.config.reconnect_timeout);
            },
            ConnectionState::Disconnected => {
                if self.error_count < self.config.max_error_count {
                    self.error_count += 1;
                    self.schedule_reconnect(self.config.reconnect_timeout);
                } else {
                    self.give_up();
                }
            },
            ConnectionState::Error => {
                if self.error_count < self.config.max_error_count {
                    self.schedule_reconnect(self.config.reconnect_timeout);
                } else {
                    self.give_up();
                }
            },
            ConnectionState::Connected => {
                self.been_connected = true;
                self.pump();
            },
        }
    }

    /// Hand the head of the queue to the link; one packet in flight at most.
    fn pump(&mut self) {
        tracing::debug!(pending = self.queue.len(), "pumping send queue");
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.pending {
            return;
        }

        head.pending = true;
        self.head_generation += 1;
        let generation = self.head_generation;

        let delivery = self.link.send(head.packet.clone());
        let internal = self.inbox.internal_sender();
        tokio::spawn(async move {
            let result = match delivery.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Closed),
            };
            internal.send(TransportCmd::HeadDone { generation, result });
        });
    }

    async fn do_reconnect(&mut self) {
        tracing::debug!("reconnect");
        if self.been_connected && !self.link.supports_reconnecting() {
            // Single-shot accepted pipe: nothing to dial, fail what is
            // queued and leave the listener to accept a fresh pipe.
            tracing::warn!("transport does not support reconnecting");
            self.last_error = Some("transport does not support reconnecting".to_string());
            self.do_disconnect();
            self.give_up();
            return;
        }

        if self.link.is_connected() {
            self.set_state(ConnectionState::Disconnecting);
            self.link.shutdown();
            self.set_state(ConnectionState::Disconnected);
        }

        self.set_state(ConnectionState::Connecting);
        match self.link.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.transport_task();
            },
            Err(error) => {
                tracing::warn!(%error, "connect failed");
                self.last_error = Some(error.to_string());
                self.error_count += 1;
                self.set_state(ConnectionState::Error);
                self.transport_task();
            },
        }
    }

    fn do_disconnect(&mut self) {
        tracing::debug!("disconnect");
        if self.state != ConnectionState::Connected {
            tracing::debug!("transport not connected");
            return;
        }

        self.set_state(ConnectionState::Disconnecting);
        self.link.shutdown();
        self.set_state(ConnectionState::Disconnected);
        self.transport_task();
    }

    /// Retry budget exhausted with no link: settle everything queued.
    fn give_up(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        tracing::error!(pending = self.queue.len(), "retry budget exhausted, failing queue");
        self.head_generation += 1;
        let reason =
            self.last_error.clone().unwrap_or_else(|| "connection unavailable".to_string());
        for packet in self.queue.drain(..) {
            packet.settle(Err(TransportError::RetriesExhausted {
                attempts: self.error_count,
                reason: reason.clone(),
            }));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }

        tracing::debug!(from = %self.state, to = %state, "state changed");
        self.state = state;
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    fn schedule_task(&mut self, delay: Duration) {
        if self.guards.try_acquire(TASK_GUARD) {
            self.inbox.push_after(delay, TransportCmd::Task);
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.guards.try_acquire(RECONNECT_GUARD) {
            self.inbox.push_after(delay, TransportCmd::Reconnect);
        }
    }
}

struct WriteJob {
    packet: Bytes,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Pipe ownership: connects via the builder and runs the I/O tasks.
struct Link {
    builder: Box<dyn PipeBuilder>,
    events: MailboxSender<TransportCmd>,
    out_tx: Option<mpsc::UnboundedSender<WriteJob>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    writer: Option<tokio::task::JoinHandle<()>>,
}

impl Link {
    fn new(builder: Box<dyn PipeBuilder>, events: MailboxSender<TransportCmd>) -> Self {
        Self { builder, events, out_tx: None, reader: None, writer: None }
    }

    fn is_connected(&self) -> bool {
        self.out_tx.is_some()
    }

    fn supports_reconnecting(&self) -> bool {
        self.builder.supports_reconnecting()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let pipe =
            self.builder.connect().await.map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(pipe);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        self.reader = Some(tokio::spawn(read_loop(read_half, self.events.clone())));
        self.writer = Some(tokio::spawn(write_loop(write_half, out_rx, self.events.clone())));
        self.out_tx = Some(out_tx);

        Ok(())
    }

    /// Queue one packet on the writer; the returned channel settles once
    /// the frame is on the wire (or the write failed).
    fn send(&self, packet: Bytes) -> oneshot::Receiver<Result<(), TransportError>> {
        let (done_tx, done_rx) = oneshot::channel();

        match &self.out_tx {
            Some(out) => {
                if let Err(rejected) = out.send(WriteJob { packet, done: done_tx }) {
                    let _ = rejected.0.done.send(Err(TransportError::Io("writer gone".into())));
                }
            },
            None => {
                let _ = done_tx.send(Err(TransportError::Io("pipe not connected".into())));
            },
        }

        done_rx
    }

    fn shutdown(&mut self) {
        self.out_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_loop(
    mut read_half: tokio::io::ReadHalf<Box<dyn crate::pipe::BytePipe>>,
    events: MailboxSender<TransportCmd>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                events.send(TransportCmd::Link(LinkEvent::Hangup));
                break;
            },
            Ok(n) => {
                let corrupt_before = decoder.corrupt_frames();
                for frame in decoder.feed(&buf[..n]) {
                    events.send(TransportCmd::Link(LinkEvent::Packet(frame)));
                }
                if decoder.corrupt_frames() > corrupt_before {
                    tracing::warn!(
                        dropped = decoder.corrupt_frames() - corrupt_before,
                        "dropped corrupt frames, resynchronized"
                    );
                }
            },
            Err(error) => {
                events.send(TransportCmd::Link(LinkEvent::ReadError(error.to_string())));
                break;
            },
        }
    }
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<Box<dyn crate::pipe::BytePipe>>,
    mut out_rx: mpsc::UnboundedReceiver<WriteJob>,
    events: MailboxSender<TransportCmd>,
) {
    while let Some(job) = out_rx.recv().await {
        let mut wire = Vec::with_capacity(job.packet.len() + 8);
        if let Err(error) = encode_frame(&job.packet, &mut wire) {
            let _ = job.done.send(Err(error.into()));
            continue;
        }

        let written = async {
            write_half.write_all(&wire).await?;
            write_half.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                let _ = job.done.send(Ok(()));
            },
            Err(error) => {
                let _ = job.done.send(Err(TransportError::Io(error.to_string())));
                events.send(TransportCmd::Link(LinkEvent::WriteError(error.to_string())));
                break;
            },
        }
    }
}
