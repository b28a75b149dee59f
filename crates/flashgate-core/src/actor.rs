//! Single-task mailbox runtime for the protocol layers.
//!
//! Every layer owns one [`Inbox`] drained by one tokio task, so all of a
//! layer's state is touched from exactly one place. The inbox merges three
//! sources, in submission order within each:
//!
//! - the *external* channel, fed by cloneable [`MailboxSender`] handles; when
//!   the last handle drops, `recv` returns `None` and the layer winds down;
//! - the *internal* channel, fed by the layer's own watcher tasks (future
//!   completions posted back to the owning task); it never closes the inbox;
//! - *delayed* commands, a deadline heap the layer schedules onto from
//!   handler code.
//!
//! [`GuardSet`] gives handlers the "guarded submission" discipline: a
//! delayed command is only scheduled while no identical one is pending, and
//! the handler releases the guard on entry.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};

/// Cloneable submission handle for one actor's inbox.
pub struct MailboxSender<C> {
    tx: mpsc::UnboundedSender<C>,
}

impl<C> Clone for MailboxSender<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

// Manual impl: commands need not be Debug for the handle to be.
impl<C> std::fmt::Debug for MailboxSender<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSender").finish_non_exhaustive()
    }
}

impl<C> MailboxSender<C> {
    /// Submit a command; returns `false` if the actor is gone.
    pub fn send(&self, cmd: C) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Submit a command, getting it back if the actor is gone.
    pub fn try_send(&self, cmd: C) -> Result<(), C> {
        self.tx.send(cmd).map_err(|e| e.0)
    }
}

/// A command waiting on the deadline heap.
#[derive(Debug)]
struct Delayed<C> {
    deadline: Instant,
    seq: u64,
    cmd: C,
}

impl<C> PartialEq for Delayed<C> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<C> Eq for Delayed<C> {}

impl<C> PartialOrd for Delayed<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Delayed<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// The receiving side of an actor's mailbox.
#[derive(Debug)]
pub struct Inbox<C> {
    external: mpsc::UnboundedReceiver<C>,
    internal: mpsc::UnboundedReceiver<C>,
    internal_tx: mpsc::UnboundedSender<C>,
    timers: BinaryHeap<Delayed<C>>,
    next_seq: u64,
    closed: bool,
}

/// Create a mailbox pair: the external handle and the actor-owned inbox.
pub fn mailbox<C>() -> (MailboxSender<C>, Inbox<C>) {
    let (external_tx, external) = mpsc::unbounded_channel();
    let (internal_tx, internal) = mpsc::unbounded_channel();
    (
        MailboxSender { tx: external_tx },
        Inbox { external, internal, internal_tx, timers: BinaryHeap::new(), next_seq: 0, closed: false },
    )
}

impl<C> Inbox<C> {
    /// Sender for the internal channel, handed to watcher tasks.
    ///
    /// Internal senders keep the actor's event flow alive but do not keep
    /// the actor alive: lifetime is bound to the external handles only.
    pub fn internal_sender(&self) -> MailboxSender<C> {
        MailboxSender { tx: self.internal_tx.clone() }
    }

    /// Schedule a command onto this inbox after `delay`.
    pub fn push_after(&mut self, delay: Duration, cmd: C) {
        self.next_seq += 1;
        self.timers.push(Delayed { deadline: Instant::now() + delay, seq: self.next_seq, cmd });
    }

    /// Receive the next command.
    ///
    /// Returns `None` once every external [`MailboxSender`] has dropped;
    /// pending timers and internal events are discarded with the actor.
    pub async fn recv(&mut self) -> Option<C> {
        loop {
            if self.closed {
                return None;
            }

            let deadline = self.timers.peek().map(|t| t.deadline);
            tokio::select! {
                cmd = self.external.recv() => match cmd {
                    Some(cmd) => return Some(cmd),
                    None => self.closed = true,
                },
                Some(cmd) = self.internal.recv() => return Some(cmd),
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(due) = self.timers.pop() {
                        return Some(due.cmd);
                    }
                },
            }
        }
    }
}

/// Set of handler identities with a submission pending.
///
/// Scheduling a guarded handler goes through [`GuardSet::try_acquire`]; a
/// second submission while the first is pending collapses into a no-op. The
/// handler calls [`GuardSet::release`] on entry so it can re-arm itself.
#[derive(Debug, Default)]
pub struct GuardSet {
    held: HashSet<&'static str>,
}

impl GuardSet {
    /// Acquire `key`; returns `false` if a submission is already pending.
    pub fn try_acquire(&mut self, key: &'static str) -> bool {
        self.held.insert(key)
    }

    /// Whether a submission of `key` is pending.
    #[must_use]
    pub fn is_pending(&self, key: &'static str) -> bool {
        self.held.contains(key)
    }

    /// Release `key`; call on handler entry.
    pub fn release(&mut self, key: &'static str) {
        self.held.remove(key);
    }
}
