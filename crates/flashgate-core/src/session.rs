//! Request/response protocol on top of the messenger.
//!
//! The session mints monotonically increasing request ids, correlates
//! inbound responses against its pending table, answers control traffic
//! (heartbeat, session-id assignment) internally, and watches peer liveness:
//! a link quiet for [`HEARTBEAT_INTERVAL`] gets a heartbeat request, and a
//! link with no traffic for [`SESSION_TIMEOUT`] is reconnected.
//!
//! # Session id
//!
//! Initially unknown. When the peer sends `SetSessionId`, the session adopts
//! the id for all subsequent outgoing envelopes and drops inbound envelopes
//! tagged with any other id. The session never originates `SetSessionId`;
//! assignment is the peer's (or the application's) business.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use flashgate_proto::{Envelope, ExchangeId, Payload, payloads::ErrorInfo};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Duration, Instant},
};

use crate::{
    actor::{GuardSet, Inbox, MailboxSender, mailbox},
    connection::ConnectionState,
    error::{HandlerError, SessionError, TransportError},
    messenger::{MessengerEvent, MessengerHandle},
};

/// Quiet-link interval after which a heartbeat request is emitted.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Traffic-free interval after which the peer is considered dead and the
/// session reconnects. 32 heartbeat intervals.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(16);

const TIMEOUT_GUARD: &str = "timeout_session";

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet-link interval before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Traffic-free interval before the peer is considered dead.
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { heartbeat_interval: HEARTBEAT_INTERVAL, timeout: SESSION_TIMEOUT }
    }
}

/// The application seam: everything a session calls back into.
///
/// The session holds the client for its own lifetime but the client must not
/// assume it outlives the stack; handlers receive the full envelope and
/// return a response payload (or an error, which the session serializes into
/// an error response for the peer).
#[async_trait]
pub trait SessionClient: Send + Sync + 'static {
    /// Serve one inbound request not handled internally by the session.
    async fn on_request(&self, request: Envelope) -> Result<Payload, HandlerError>;

    /// Observe a connection state change.
    fn on_state_changed(&self, _state: ConnectionState) {}

    /// Observe a recoverable transport error.
    fn on_error(&self) {}
}

/// Future for one issued request.
///
/// Settles with the peer's response envelope, a delivery failure, or
/// [`SessionError::Closed`] when the session is torn down with the request
/// pending.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Envelope, SessionError>>,
}

impl Future for ResponseFuture {
    type Output = Result<Envelope, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(SessionError::Closed)))
    }
}

enum SessionCmd {
    Request { payload: Payload, done: oneshot::Sender<Result<Envelope, SessionError>> },
    Reconnect,
    Disconnect,
    Shutdown,
    QueryState(oneshot::Sender<ConnectionState>),
    TimeoutTick,
    ClientRequestDone { request_id: u64, result: Result<Payload, HandlerError> },
    DeliveryDone { request_id: Option<u64>, result: Result<(), TransportError> },
    HeartbeatDone,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: MailboxSender<SessionCmd>,
}

impl SessionHandle {
    /// Issue a request; the session attaches the next request id and the
    /// current session id.
    pub fn request(&self, payload: Payload) -> ResponseFuture {
        let (done_tx, done_rx) = oneshot::channel();
        if let Err(SessionCmd::Request { done, .. }) =
            self.tx.try_send(SessionCmd::Request { payload, done: done_tx })
        {
            let _ = done.send(Err(SessionError::Closed));
        }
        ResponseFuture { rx: done_rx }
    }

    /// Request a transition to `Connected`.
    pub fn reconnect(&self) {
        self.tx.send(SessionCmd::Reconnect);
    }

    /// Request a transition to `Disconnected`.
    ///
    /// Every pending request future settles with [`SessionError::Closed`].
    pub fn disconnect(&self) {
        self.tx.send(SessionCmd::Disconnect);
    }

    /// Tear the stack down: disconnect, settle every pending request with
    /// [`SessionError::Closed`], and stop the session task.
    ///
    /// Clients may hold handles to the session (a back-reference cycle the
    /// reference counts cannot break on their own); `shutdown` is the
    /// deterministic way to end such a stack.
    pub fn shutdown(&self) {
        self.tx.send(SessionCmd::Shutdown);
    }

    /// Current connection state; `Disconnected` if the session is gone.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if !self.tx.send(SessionCmd::QueryState(tx)) {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }
}

/// Spawn a session over a messenger.
///
/// The actor winds down, settling every pending request with
/// [`SessionError::Closed`], when the last [`SessionHandle`] drops or the
/// messenger goes away.
pub fn spawn_session(
    messenger: MessengerHandle,
    messenger_events: mpsc::UnboundedReceiver<MessengerEvent>,
    client: Arc<dyn SessionClient>,
    config: SessionConfig,
) -> SessionHandle {
    let (handle_tx, inbox) = mailbox();

    let actor = SessionActor {
        config,
        client,
        messenger,
        session_id: None,
        next_request_id: 0,
        waiting: HashMap::new(),
        queue: VecDeque::new(),
        last_transfer: Instant::now(),
        heartbeat_outstanding: false,
        state: ConnectionState::Disconnected,
        guards: GuardSet::default(),
        inbox,
    };

    tokio::spawn(actor.run(messenger_events));

    SessionHandle { tx: handle_tx }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One queued outbound message: a request awaiting its response or a
/// response awaiting delivery.
struct PendingMessage {
    envelope: Envelope,
    done: Option<oneshot::Sender<Result<Envelope, SessionError>>>,
}

struct SessionActor {
    config: SessionConfig,
    client: Arc<dyn SessionClient>,
    messenger: MessengerHandle,
    session_id: Option<u64>,
    next_request_id: u64,
    waiting: HashMap<u64, oneshot::Sender<Result<Envelope, SessionError>>>,
    queue: VecDeque<PendingMessage>,
    last_transfer: Instant,
    heartbeat_outstanding: bool,
    state: ConnectionState,
    guards: GuardSet,
    inbox: Inbox<SessionCmd>,
}

impl SessionActor {
    async fn run(mut self, mut messenger_events: mpsc::UnboundedReceiver<MessengerEvent>) {
        loop {
            tokio::select! {
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd) == Flow::Stop {
                            break;
                        }
                    },
                    None => break,
                },
                event = messenger_events.recv() => match event {
                    Some(event) => self.handle_messenger_event(event),
                    None => break,
                },
            }
        }

        self.fail_pending(&SessionError::Closed);
    }

    fn handle(&mut self, cmd: SessionCmd) -> Flow {
        match cmd {
            SessionCmd::Request { payload, done } => {
                self.enqueue_request(payload, done);
                self.pump();
            },
            SessionCmd::Reconnect => self.messenger.reconnect(),
            SessionCmd::Disconnect => {
                self.messenger.disconnect();
                self.fail_pending(&SessionError::Closed);
            },
            SessionCmd::Shutdown => {
                tracing::debug!("session shutting down");
                self.messenger.disconnect();
                return Flow::Stop;
            },
            SessionCmd::QueryState(tx) => {
                let _ = tx.send(self.state);
            },
            SessionCmd::TimeoutTick => {
                self.guards.release(TIMEOUT_GUARD);
                self.timeout_session();
            },
            SessionCmd::ClientRequestDone { request_id, result } => {
                self.on_request_done(request_id, result);
            },
            SessionCmd::DeliveryDone { request_id, result } => {
                self.on_delivery_done(request_id, result);
            },
            SessionCmd::HeartbeatDone => self.heartbeat_outstanding = false,
        }
        Flow::Continue
    }

    /// Mint a request id, wrap the payload, and queue the request.
    fn enqueue_request(
        &mut self,
        payload: Payload,
        done: oneshot::Sender<Result<Envelope, SessionError>>,
    ) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let envelope = Envelope::request(self.session_id.unwrap_or(0), request_id, payload);
        tracing::debug!(request_id, "queueing request");
        self.queue.push_back(PendingMessage { envelope, done: Some(done) });
    }

    /// Drain the outbound queue into the messenger.
    ///
    /// Requests enter the correlation table before their envelope is handed
    /// down, so a fast peer cannot respond to an untracked id.
    fn pump(&mut self) {
        while let Some(mut pending) = self.queue.pop_front() {
            let request_id = match pending.envelope.id {
                Some(ExchangeId::Request(id)) => {
                    if let Some(done) = pending.done.take() {
                        debug_assert!(!self.waiting.contains_key(&id));
                        self.waiting.insert(id, done);
                    }
                    Some(id)
                },
                _ => None,
            };

            let outgoing = self.messenger.send(pending.envelope);
            let internal = self.inbox.internal_sender();
            tokio::spawn(async move {
                let result = outgoing.done().await;
                internal.send(SessionCmd::DeliveryDone { request_id, result });
            });
        }
    }

    /// A queued message finished (or failed) delivery.
    fn on_delivery_done(
        &mut self,
        request_id: Option<u64>,
        result: Result<(), TransportError>,
    ) {
        match result {
            Ok(()) => self.update_last_transfer(),
            Err(error) => {
                if let Some(request_id) = request_id {
                    if let Some(done) = self.waiting.remove(&request_id) {
                        tracing::warn!(request_id, %error, "request could not be delivered");
                        let _ = done.send(Err(error.into()));
                    }
                }
            },
        }
    }

    /// A client handler finished; wrap its outcome into a response envelope.
    fn on_request_done(&mut self, request_id: u64, result: Result<Payload, HandlerError>) {
        let payload = match result {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(request_id, %error, "request handler failed");
                Payload::Error(ErrorInfo::new(error.to_string()))
            },
        };

        let envelope = Envelope::response(self.session_id.unwrap_or(0), request_id, payload);
        tracing::debug!(request_id, "queueing response");
        self.queue.push_back(PendingMessage { envelope, done: None });
        self.pump();
    }

    fn handle_messenger_event(&mut self, event: MessengerEvent) {
        match event {
            MessengerEvent::MessageReceived(envelope) => self.on_message_received(envelope),
            MessengerEvent::StateChanged(state) => {
                self.state = state;
                if state.is_connected() {
                    self.update_last_transfer();
                }
                self.client.on_state_changed(state);
            },
            MessengerEvent::Error => self.client.on_error(),
        }
    }

    fn on_message_received(&mut self, envelope: Envelope) {
        if let Some(session_id) = self.session_id {
            if envelope.session_id != session_id {
                tracing::warn!(
                    expected = session_id,
                    got = envelope.session_id,
                    "dropping message with invalid session id"
                );
                return;
            }
        }

        self.update_last_transfer();

        match envelope.id {
            Some(ExchangeId::Request(request_id)) => self.on_request(request_id, envelope),
            Some(ExchangeId::Response(response_id)) => self.on_response(response_id, envelope),
            None => {
                tracing::warn!("dropping message that is neither request nor response");
            },
        }
    }

    /// Inbound request: control handlers first, then the client.
    fn on_request(&mut self, request_id: u64, envelope: Envelope) {
        tracing::debug!(request_id, "request received");

        match envelope.payload {
            Some(Payload::Heartbeat) => self.on_request_done(request_id, Ok(Payload::Ok)),
            Some(Payload::SetSessionId(session_id)) => {
                tracing::debug!(session_id, "adopting session id");
                self.session_id = Some(session_id);
                self.on_request_done(request_id, Ok(Payload::Ok));
            },
            _ => {
                let client = Arc::clone(&self.client);
                let internal = self.inbox.internal_sender();
                tokio::spawn(async move {
                    let result = client.on_request(envelope).await;
                    internal.send(SessionCmd::ClientRequestDone { request_id, result });
                });
            },
        }
    }

    /// Inbound response: settle the matching pending request.
    fn on_response(&mut self, response_id: u64, envelope: Envelope) {
        match self.waiting.remove(&response_id) {
            Some(done) => {
                tracing::debug!(response_id, "completing request");
                let _ = done.send(Ok(envelope));
            },
            None => {
                tracing::warn!(response_id, "dropping response for unknown request id");
            },
        }
    }

    fn update_last_transfer(&mut self) {
        self.last_transfer = Instant::now();
        self.schedule_timeout(self.config.heartbeat_interval);
    }

    /// Liveness check: reconnect a dead link, heartbeat a quiet one.
    fn timeout_session(&mut self) {
        if !self.state.is_connected() {
            return;
        }

        let quiet = Instant::now().duration_since(self.last_transfer);
        tracing::debug!(?quiet, "liveness check");

        if quiet > self.config.timeout {
            tracing::error!(?quiet, "session timed out, reconnecting");
            self.messenger.reconnect();
            return;
        }

        self.schedule_timeout(self.config.timeout);

        if quiet >= self.config.heartbeat_interval && !self.heartbeat_outstanding {
            self.heartbeat_outstanding = true;

            let (done_tx, done_rx) = oneshot::channel();
            self.enqueue_request(Payload::Heartbeat, done_tx);
            self.pump();

            let internal = self.inbox.internal_sender();
            tokio::spawn(async move {
                let _ = done_rx.await;
                internal.send(SessionCmd::HeartbeatDone);
            });
        }
    }

    /// A pending timeout supersedes a re-arming call.
    fn schedule_timeout(&mut self, delay: Duration) {
        if self.guards.try_acquire(TIMEOUT_GUARD) {
            self.inbox.push_after(delay, SessionCmd::TimeoutTick);
        }
    }

    fn fail_pending(&mut self, error: &SessionError) {
        for (_, done) in self.waiting.drain() {
            let _ = done.send(Err(error.clone()));
        }
        for pending in self.queue.drain(..) {
            if let Some(done) = pending.done {
                let _ = done.send(Err(error.clone()));
            }
        }
    }
}
