//! Unbuffered rendezvous channels and the sitter/visitor protocol that pairs
//! a sender with a receiver across threads.
//!
//! Each channel keeps strict-FIFO sender and receiver queues under one
//! mutex. A participant that arrives to find the opposite queue non-empty
//! becomes a visitor and attempts the transfer immediately; otherwise it
//! becomes a sitter and waits on its own pipe (see `protocol.rs`) for a
//! visitor to complete the rendezvous. The queue mutex already decides a
//! winner before any pipe byte is written, so the wire protocol only needs
//! one pipe per participant and three messages.

mod protocol;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::descriptor::IoDescriptor;
use crate::error::{Error, ErrorKind};
use crate::event::{EventContext, FulfillmentSlot, SelectEvent};
use crate::pipe::{Pipe, PipePool};
use protocol::Message;

/// A queued participant waiting to rendezvous: its pipe, the `select` call
/// context that will judge whether it won, whether it's been poked, and a
/// shared cell through which a value moves in either direction.
struct Participant<T> {
    pipe: Pipe,
    context: Mutex<Option<EventContext>>,
    poked: AtomicBool,
    cargo: Arc<Mutex<Option<T>>>,
}

struct Queues<T> {
    senders: VecDeque<Arc<Participant<T>>>,
    receivers: VecDeque<Arc<Participant<T>>>,
}

impl<T> Queues<T> {
    fn new() -> Self {
        Queues {
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }
    }
}

struct ChannelInner<T> {
    queues: Mutex<Queues<T>>,
    pipes: PipePool,
}

/// Which side of the rendezvous an event plays. Determines which queue is
/// "mine" (`teammates`) and which is the other side's (`opponents`), per
/// `original_source`'s `SendEventPolicy`/`RecvEventPolicy`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Send,
    Recv,
}

impl Kind {
    fn split<'a, T>(
        self,
        queues: &'a mut Queues<T>,
    ) -> (
        &'a mut VecDeque<Arc<Participant<T>>>,
        &'a mut VecDeque<Arc<Participant<T>>>,
    ) {
        match self {
            Kind::Send => (&mut queues.senders, &mut queues.receivers),
            Kind::Recv => (&mut queues.receivers, &mut queues.senders),
        }
    }
}

/// Move the value between two participants' cargo cells under both
/// fulfillment-slot locks (see [`crate::event::FulfillmentSlot::try_fulfill_pair_with`]).
/// A send moves its own cargo into the opponent's; a recv takes the
/// opponent's cargo into its own.
fn do_transfer<T>(kind: Kind, me: &Participant<T>, them: &Participant<T>) {
    match kind {
        Kind::Send => {
            let value = me.cargo.lock().unwrap_or_else(|e| e.into_inner()).take();
            *them.cargo.lock().unwrap_or_else(|e| e.into_inner()) = value;
        }
        Kind::Recv => {
            let value = them.cargo.lock().unwrap_or_else(|e| e.into_inner()).take();
            *me.cargo.lock().unwrap_or_else(|e| e.into_inner()) = value;
        }
    }
}

/// Construct a new unbuffered, synchronous rendezvous channel.
///
/// Every value handed to [`Sender::send`] is passed directly to whichever
/// [`Receiver::recv`] is paired with it; nothing is ever buffered, and
/// there is no way to close a channel. Model end-of-stream with a sentinel
/// value or a separate signaling channel instead.
pub fn channel<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(ChannelInner {
        queues: Mutex::new(Queues::new()),
        pipes: PipePool::new(),
    });
    (Sender { inner: inner.clone() }, Receiver { inner })
}

/// The sending half of a channel created by [`channel`]. Cloning a `Sender`
/// gives another handle to the same channel state; the state outlives the
/// last dropped handle on either side.
pub struct Sender<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Sender<T> {
    /// Build a selectable send event carrying `value`. The event does
    /// nothing by itself until it's driven by [`crate::select`] (or
    /// [`Sender::send_blocking`]).
    pub fn send(&self, value: T) -> SendEvent<T> {
        SendEvent {
            inner: self.inner.clone(),
            cargo: Arc::new(Mutex::new(Some(value))),
            context: None,
            participant: None,
        }
    }

    /// Send `value`, blocking the calling thread until a receiver takes it.
    /// Equivalent to running a single-event `select` over [`Sender::send`].
    pub fn send_blocking(&self, value: T) -> Result<(), Error> {
        let event = self.send(value);
        crate::selector::select(vec![Box::new(event)])?;
        Ok(())
    }
}

/// The receiving half of a channel created by [`channel`].
pub struct Receiver<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Build a selectable receive event. `select` boxes its events as
    /// `dyn SelectEvent + 'static`, so a `RecvEvent` can't borrow a
    /// caller's `&mut T`; it owns its output cell instead. Call
    /// [`RecvEvent::slot`] *before* boxing the event for [`crate::select`]
    /// to get a handle you can read the received value back out of
    /// afterward.
    pub fn recv(&self) -> RecvEvent<T> {
        RecvEvent {
            inner: self.inner.clone(),
            cargo: Arc::new(Mutex::new(None)),
            context: None,
            participant: None,
        }
    }

    /// Receive a value, blocking the calling thread until a sender offers
    /// one. Equivalent to running a single-event `select` over
    /// [`Receiver::recv`] and reading its slot afterward.
    pub fn recv_blocking(&self) -> Result<T, Error> {
        let event = self.recv();
        let slot = event.slot();
        crate::selector::select(vec![Box::new(event)])?;
        slot.take()
            .ok_or_else(|| Error::other("recv_blocking completed without a value"))
    }
}

/// A handle to a [`RecvEvent`]'s output cell, cloned out before the event is
/// boxed and handed to `select` so the received value can still be read
/// back afterward.
pub struct RecvSlot<T> {
    cargo: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for RecvSlot<T> {
    fn clone(&self) -> Self {
        RecvSlot { cargo: self.cargo.clone() }
    }
}

impl<T> RecvSlot<T> {
    /// Take the received value, if the paired `RecvEvent` has completed.
    /// Returns `None` if the rendezvous hasn't happened (yet, or ever).
    pub fn take(&self) -> Option<T> {
        self.cargo.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// A selectable send event built by [`Sender::send`].
pub struct SendEvent<T> {
    inner: Arc<ChannelInner<T>>,
    cargo: Arc<Mutex<Option<T>>>,
    context: Option<EventContext>,
    participant: Option<Arc<Participant<T>>>,
}

/// A selectable receive event built by [`Receiver::recv`].
pub struct RecvEvent<T> {
    inner: Arc<ChannelInner<T>>,
    cargo: Arc<Mutex<Option<T>>>,
    context: Option<EventContext>,
    participant: Option<Arc<Participant<T>>>,
}

impl<T> RecvEvent<T> {
    /// A cloneable handle to this event's output cell; see
    /// [`Receiver::recv`].
    pub fn slot(&self) -> RecvSlot<T> {
        RecvSlot { cargo: self.cargo.clone() }
    }
}

macro_rules! impl_select_event {
    ($ty:ident, $kind:expr) => {
        impl<T: Send + 'static> SelectEvent for $ty<T> {
            fn bind(&mut self, context: EventContext) {
                self.context = Some(context);
            }

            fn file(&mut self) -> Result<IoDescriptor, Error> {
                file(
                    $kind,
                    &self.inner,
                    &self.cargo,
                    self.context.as_ref().expect("bind() runs before file()"),
                    &mut self.participant,
                )
            }

            fn fulfill(
                &mut self,
                descriptor: &IoDescriptor,
            ) -> Result<IoDescriptor, Error> {
                let participant = self
                    .participant
                    .clone()
                    .expect("file() runs before fulfill()");
                fulfill($kind, &self.inner, &participant, descriptor)
            }

            fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
                let participant = match self.participant.take() {
                    Some(p) => p,
                    None => return Ok(()),
                };
                let context = self.context.as_ref().expect("bind() runs before cancel()");
                cancel($kind, &self.inner, &participant, context)
            }
        }
    };
}

impl_select_event!(SendEvent, Kind::Send);
impl_select_event!(RecvEvent, Kind::Recv);

/// Shared `file()` body for both event kinds: allocate a pipe, enqueue this
/// participant, and decide whether it becomes a visitor (attempting the
/// transfer immediately) or a sitter (waiting on its own pipe).
fn file<T>(
    kind: Kind,
    inner: &Arc<ChannelInner<T>>,
    cargo: &Arc<Mutex<Option<T>>>,
    context: &EventContext,
    participant_slot: &mut Option<Arc<Participant<T>>>,
) -> Result<IoDescriptor, Error> {
    let pipe = inner.pipes.take()?;
    let participant = Arc::new(Participant {
        pipe,
        context: Mutex::new(Some(context.clone())),
        poked: AtomicBool::new(false),
        cargo: cargo.clone(),
    });
    *participant_slot = Some(participant.clone());

    let opponent = {
        let mut guard = inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        let (teammates, opponents) = kind.split(&mut guard);
        teammates.push_back(participant.clone());
        if teammates.len() == 1 && !opponents.is_empty() {
            opponents.front().cloned()
        } else {
            None
        }
    };

    match opponent {
        Some(them) => attempt_transfer(kind, inner, &participant, &them),
        None => Ok(IoDescriptor::readable(participant.pipe.read_fd())),
    }
}

/// Try to commit this participant (the visitor) against `them` (the
/// opponent queue's head, the sitter). On success, the transfer has already
/// happened and `them` has been told via the pipe; on failure (either slot
/// no longer `FULFILLABLE`), this participant simply becomes a sitter like
/// any other and waits its turn.
fn attempt_transfer<T>(
    kind: Kind,
    inner: &Arc<ChannelInner<T>>,
    me: &Arc<Participant<T>>,
    them: &Arc<Participant<T>>,
) -> Result<IoDescriptor, Error> {
    let my_context = me
        .context
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("participant context set in file()");
    let their_context = them
        .context
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("participant context set in file()");

    let committed = FulfillmentSlot::try_fulfill_pair_with(
        &my_context.fulfillment,
        my_context.key,
        &their_context.fulfillment,
        their_context.key,
        || do_transfer(kind, me, them),
    );

    match committed {
        Some(()) => {
            let write_result = protocol::write_message(them.pipe.write_fd(), Message::Done);
            cleanup(kind, inner, me);
            write_result?;
            Ok(IoDescriptor::already_fulfilled())
        }
        None => Ok(IoDescriptor::readable(me.pipe.read_fd())),
    }
}

/// Shared `fulfill()` body: read this participant's protocol byte and act
/// on it. `DONE` and `ERROR` mean a visitor already committed the transfer
/// on our behalf; `POKE` asks us to recheck whether we can now become a
/// visitor ourselves.
fn fulfill<T>(
    kind: Kind,
    inner: &Arc<ChannelInner<T>>,
    participant: &Arc<Participant<T>>,
    descriptor: &IoDescriptor,
) -> Result<IoDescriptor, Error> {
    if descriptor.has_hangup() || descriptor.has_error() || descriptor.is_invalid() {
        return Err(Error::other("channel participant's pipe reported a read error"));
    }

    let message = protocol::read_message(participant.pipe.read_fd())?;
    match message {
        Message::Done => {
            cleanup(kind, inner, participant);
            Ok(IoDescriptor::already_fulfilled())
        }
        Message::Error => {
            cleanup(kind, inner, participant);
            Err(Error::new(ErrorKind::Transfer))
        }
        Message::Poke => {
            // Processed; a future poke needs to see this cleared so we're
            // reconsidered eligible to be poked again later.
            participant.poked.store(false, Ordering::SeqCst);

            let opponent = {
                let mut guard = inner.queues.lock().unwrap_or_else(|e| e.into_inner());
                let (_, opponents) = kind.split(&mut guard);
                match opponents.front() {
                    // Only become a visitor if the opponent head hasn't
                    // also just been poked. Otherwise both sides could try
                    // to visit each other at once and deadlock on each
                    // other's fulfillment-slot locks.
                    Some(head) if !head.poked.load(Ordering::SeqCst) => Some(head.clone()),
                    _ => None,
                }
            };

            match opponent {
                Some(them) => attempt_transfer(kind, inner, participant, &them),
                None => Ok(IoDescriptor::readable(participant.pipe.read_fd())),
            }
        }
    }
}

/// Shared `cancel()` body. If this record's own fulfillment slot already
/// names this event's key as the winner, a peer committed the rendezvous
/// concurrently (a selector cross-thread race) and a `DONE`/`ERROR` byte is
/// waiting in our pipe that must still be drained. Otherwise this is a
/// genuine loser: just detach from the queue.
fn cancel<T>(
    kind: Kind,
    inner: &Arc<ChannelInner<T>>,
    participant: &Arc<Participant<T>>,
    context: &EventContext,
) -> Result<(), Error> {
    if context.fulfillment.fulfilled_key() == Some(context.key) {
        let message = protocol::read_message(participant.pipe.read_fd())?;
        cleanup(kind, inner, participant);
        return match message {
            Message::Error => Err(Error::new(ErrorKind::Transfer)),
            _ => Ok(()),
        };
    }

    cleanup(kind, inner, participant);
    Ok(())
}

/// Remove `participant` from its own queue. If it was at the head and the
/// queue remains non-empty with an opponent still waiting, poke the new
/// head so it can re-evaluate becoming a visitor. This hand-off prevents
/// both sides starving each other when the opponent is also sitting.
fn cleanup<T>(kind: Kind, inner: &Arc<ChannelInner<T>>, participant: &Arc<Participant<T>>) {
    let mut guard = inner.queues.lock().unwrap_or_else(|e| e.into_inner());
    let (teammates, opponents) = kind.split(&mut guard);

    let was_head = teammates.front().map_or(false, |head| Arc::ptr_eq(head, participant));
    teammates.retain(|p| !Arc::ptr_eq(p, participant));

    if was_head && !opponents.is_empty() {
        if let Some(new_head) = teammates.front() {
            new_head.poked.store(true, Ordering::SeqCst);
            let _ = protocol::write_message(new_head.pipe.write_fd(), Message::Poke);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_then_recv_round_trips_across_threads() {
        let (tx, rx) = channel::<String>();

        let sender = thread::spawn(move || {
            tx.send_blocking("foo".to_string()).unwrap();
        });

        let value = rx.recv_blocking().unwrap();
        assert_eq!(value, "foo");
        sender.join().unwrap();
    }

    #[test]
    fn recv_before_send_still_rendezvous() {
        let (tx, rx) = channel::<i32>();

        let receiver = thread::spawn(move || rx.recv_blocking().unwrap());

        thread::sleep(Duration::from_millis(20));
        tx.send_blocking(42).unwrap();

        assert_eq!(receiver.join().unwrap(), 42);
    }

    #[test]
    fn many_sitters_are_served_in_fifo_order() {
        let (tx, rx) = channel::<i32>();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let rx = rx.clone();
            receivers.push(thread::spawn(move || rx.recv_blocking().unwrap()));
        }

        thread::sleep(Duration::from_millis(20));
        for i in 0..4 {
            tx.send_blocking(i).unwrap();
        }

        let mut results: Vec<i32> = receivers.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[test]
    fn select_over_send_and_recv_picks_the_ready_one() {
        let (tx, rx) = channel::<i32>();
        let sender = thread::spawn(move || tx.send_blocking(7).unwrap());
        thread::sleep(Duration::from_millis(20));

        let recv_event = rx.recv();
        let slot = recv_event.slot();
        let timeout_event = crate::time_events::timeout(Duration::from_secs(3600));

        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(recv_event), Box::new(timeout_event)];
        let winner = crate::selector::select(events).unwrap();
        assert_eq!(winner, 0);
        assert_eq!(slot.take(), Some(7));
        sender.join().unwrap();
    }
}
