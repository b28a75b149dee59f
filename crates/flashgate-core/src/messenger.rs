//! Envelope layer: typed messages over byte packets.
//!
//! The messenger serializes [`Envelope`]s to packets on the way down and
//! deserializes packets on the way up, dropping (with a warning) anything
//! that does not parse. Connection state passes straight through with
//! same-state suppression.
//!
//! Every [`OutgoingMessage`] is linked to its underlying packet through a
//! generation marker: if the message is ever re-linked to a fresh packet
//! (reconnect-driven retry), only the completion of the latest packet
//! settles the message future; notifications from superseded packets are
//! ignored. Two packets completing must never double-settle the message.

use flashgate_proto::Envelope;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

use crate::{
    actor::{Inbox, MailboxSender, mailbox},
    connection::{ConnectionState, StateGate},
    error::TransportError,
    transport::{OutgoingPacket, TransportEvent, TransportHandle},
};

/// Events a messenger delivers to the session.
#[derive(Debug)]
pub enum MessengerEvent {
    /// One decoded inbound envelope.
    MessageReceived(Envelope),
    /// Connection state, duplicates suppressed.
    StateChanged(ConnectionState),
    /// A recoverable transport error occurred.
    Error,
}

/// Handle to an enqueued envelope.
///
/// Settles exactly once, from the completion of the latest underlying
/// packet.
#[derive(Debug)]
pub struct OutgoingMessage {
    envelope: Envelope,
    done: oneshot::Receiver<Result<(), TransportError>>,
}

impl OutgoingMessage {
    /// The envelope this handle tracks.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Wait for delivery or a terminal error.
    pub async fn done(self) -> Result<(), TransportError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }
}

enum MessengerCmd {
    Send { envelope: Envelope, done: oneshot::Sender<Result<(), TransportError>> },
    Reconnect,
    Disconnect,
    QueryState(oneshot::Sender<ConnectionState>),
    PacketDone { msg_id: u64, generation: u64, result: Result<(), TransportError> },
}

/// Cloneable handle to a running messenger.
#[derive(Debug, Clone)]
pub struct MessengerHandle {
    tx: MailboxSender<MessengerCmd>,
}

impl MessengerHandle {
    /// Serialize and enqueue an envelope.
    pub fn send(&self, envelope: Envelope) -> OutgoingMessage {
        let (done_tx, done_rx) = oneshot::channel();
        let out = OutgoingMessage { envelope: envelope.clone(), done: done_rx };

        if let Err(MessengerCmd::Send { done, .. }) =
            self.tx.try_send(MessengerCmd::Send { envelope, done: done_tx })
        {
            let _ = done.send(Err(TransportError::Closed));
        }

        out
    }

    /// Request a transition to `Connected`.
    pub fn reconnect(&self) {
        self.tx.send(MessengerCmd::Reconnect);
    }

    /// Request a transition to `Disconnected`.
    pub fn disconnect(&self) {
        self.tx.send(MessengerCmd::Disconnect);
    }

    /// Current connection state; `Disconnected` if the messenger is gone.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if !self.tx.send(MessengerCmd::QueryState(tx)) {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }
}

/// Spawn a messenger over a transport.
pub fn spawn_messenger(
    transport: TransportHandle,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (MessengerHandle, mpsc::UnboundedReceiver<MessengerEvent>) {
    let (handle_tx, inbox) = mailbox();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let actor = MessengerActor {
        transport,
        events: events_tx,
        gate: StateGate::default(),
        outgoing: HashMap::new(),
        next_msg_id: 0,
        inbox,
    };

    tokio::spawn(actor.run(transport_events));

    (MessengerHandle { tx: handle_tx }, events_rx)
}

struct OutgoingEntry {
    generation: u64,
    done: oneshot::Sender<Result<(), TransportError>>,
}

struct MessengerActor {
    transport: TransportHandle,
    events: mpsc::UnboundedSender<MessengerEvent>,
    gate: StateGate,
    outgoing: HashMap<u64, OutgoingEntry>,
    next_msg_id: u64,
    inbox: Inbox<MessengerCmd>,
}

impl MessengerActor {
    async fn run(mut self, mut transport_events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            tokio::select! {
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => break,
                },
            }
        }
    }

    fn handle(&mut self, cmd: MessengerCmd) {
        match cmd {
            MessengerCmd::Send { envelope, done } => self.handle_send(envelope, done),
            MessengerCmd::Reconnect => self.transport.reconnect(),
            MessengerCmd::Disconnect => self.transport.disconnect(),
            MessengerCmd::QueryState(tx) => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let _ = tx.send(transport.state().await);
                });
            },
            MessengerCmd::PacketDone { msg_id, generation, result } => {
                self.handle_packet_done(msg_id, generation, result);
            },
        }
    }

    fn handle_send(
        &mut self,
        envelope: Envelope,
        done: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, "dropping unencodable envelope");
                let _ = done.send(Err(error.into()));
                return;
            },
        };

        self.next_msg_id += 1;
        let msg_id = self.next_msg_id;
        self.outgoing.insert(msg_id, OutgoingEntry { generation: 0, done });

        let packet = self.transport.send(bytes);
        self.link_packet(msg_id, packet);
    }

    /// Associate a message with a (new) underlying packet.
    ///
    /// Stores a fresh generation marker; completion callbacks compare their
    /// marker against the current one and return silently when superseded.
    fn link_packet(&mut self, msg_id: u64, packet: OutgoingPacket) {
        let Some(entry) = self.outgoing.get_mut(&msg_id) else {
            return;
        };

        entry.generation += 1;
        let generation = entry.generation;
        let internal = self.inbox.internal_sender();
        tokio::spawn(async move {
            let result = packet.done().await;
            internal.send(MessengerCmd::PacketDone { msg_id, generation, result });
        });
    }

    fn handle_packet_done(
        &mut self,
        msg_id: u64,
        generation: u64,
        result: Result<(), TransportError>,
    ) {
        let Some(entry) = self.outgoing.get(&msg_id) else {
            tracing::debug!(msg_id, "completion for settled message, ignoring");
            return;
        };
        if entry.generation != generation {
            tracing::debug!(msg_id, "stale marker, ignoring completion");
            return;
        }

        if let Some(entry) = self.outgoing.remove(&msg_id) {
            let _ = entry.done.send(result);
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PacketReceived(packet) => match Envelope::decode(&packet) {
                Ok(envelope) => {
                    let _ = self.events.send(MessengerEvent::MessageReceived(envelope));
                },
                Err(error) => {
                    tracing::warn!(%error, len = packet.len(), "dropping undecodable packet");
                },
            },
            TransportEvent::StateChanged(state) => {
                if self.gate.admit(state) {
                    let _ = self.events.send(MessengerEvent::StateChanged(state));
                } else {
                    tracing::debug!(%state, "discarding duplicate state notification");
                }
            },
            TransportEvent::Error => {
                let _ = self.events.send(MessengerEvent::Error);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;
    use crate::transport::TransportCmd;
    use flashgate_proto::Payload;

    struct TestRig {
        actor: MessengerActor,
        events: mpsc::UnboundedReceiver<MessengerEvent>,
        transport_inbox: actor::Inbox<TransportCmd>,
        // Keeps the actor's inbox open for the duration of the test.
        _handle: MailboxSender<MessengerCmd>,
    }

    fn test_rig() -> TestRig {
        let (transport_tx, transport_inbox) = actor::mailbox();
        let (handle_tx, inbox) = actor::mailbox();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = MessengerActor {
            transport: TransportHandle::from_sender(transport_tx),
            events: events_tx,
            gate: StateGate::default(),
            outgoing: HashMap::new(),
            next_msg_id: 0,
            inbox,
        };

        TestRig { actor, events: events_rx, transport_inbox, _handle: handle_tx }
    }

    #[tokio::test]
    async fn stale_marker_settles_once_from_latest_packet() {
        let mut rig = test_rig();
        let actor = &mut rig.actor;

        let envelope = Envelope::request(0, 1, Payload::Heartbeat);
        let (done_tx, done_rx) = oneshot::channel();
        actor.handle_send(envelope, done_tx);

        // The first underlying packet: captured and never completed.
        let first_done = match rig.transport_inbox.recv().await {
            Some(TransportCmd::Send { done, .. }) => done,
            _ => unreachable!("expected a transport send"),
        };

        // Replace the underlying packet, as a reconnect-driven retry would.
        let (second_tx, second_rx) = oneshot::channel();
        let second = OutgoingPacket::new(bytes::Bytes::from_static(b"x"), second_rx);
        actor.link_packet(1, second);

        // The superseded packet completing must be ignored; the live one
        // settles the message.
        let _ = first_done.send(Ok(()));
        let _ = second_tx.send(Ok(()));

        for _ in 0..2 {
            match actor.inbox.recv().await {
                Some(MessengerCmd::PacketDone { msg_id, generation, result }) => {
                    actor.handle_packet_done(msg_id, generation, result);
                },
                _ => unreachable!("expected a packet completion"),
            }
        }

        assert!(matches!(done_rx.await, Ok(Ok(()))));
        assert!(actor.outgoing.is_empty());
    }

    #[tokio::test]
    async fn undecodable_packet_is_dropped() {
        let mut rig = test_rig();
        let actor = &mut rig.actor;
        let events = &mut rig.events;

        actor.handle_transport_event(TransportEvent::PacketReceived(bytes::Bytes::from_static(
            &[0xFF, 0x13],
        )));
        actor.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected));

        // Only the state change came through.
        match events.recv().await {
            Some(MessengerEvent::StateChanged(ConnectionState::Connected)) => {},
            other => unreachable!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_states_are_suppressed() {
        let mut rig = test_rig();
        let actor = &mut rig.actor;
        let events = &mut rig.events;

        actor.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connecting));
        actor.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connecting));
        actor.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected));

        assert!(matches!(
            events.recv().await,
            Some(MessengerEvent::StateChanged(ConnectionState::Connecting))
        ));
        assert!(matches!(
            events.recv().await,
            Some(MessengerEvent::StateChanged(ConnectionState::Connected))
        ));
        assert!(events.try_recv().is_err());
    }
}
