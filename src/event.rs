//! The capability every `select`-able event implements, and the shared
//! commit point ([`FulfillmentSlot`]) that lets two independent `select`
//! calls agree on which single event wins a cross-thread rendezvous.

use std::sync::{Arc, Mutex};

use crate::descriptor::IoDescriptor;
use crate::error::Error;

/// Identifies one event within a single `select` call, by its position in
/// the list passed to [`crate::selector::select`].
pub type EventKey = usize;

/// The state of a [`FulfillmentSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// No event sharing this slot has committed yet; any of them still
    /// may.
    Fulfillable,
    /// One event has committed. `FulfillmentSlot::fulfilled_key` names
    /// which.
    Fulfilled,
    /// The slot can never be fulfilled (e.g. the channel it guards was
    /// dropped, or cancellation already claimed it).
    Unfulfillable,
}

struct FulfillmentSlotInner {
    state: SlotState,
    fulfilled_key: Option<EventKey>,
}

/// A shared, mutex-guarded commit flag between two sides of a channel
/// rendezvous (or, for a single-sided event, just a cancellation flag).
///
/// Both the sender-side and receiver-side `SelectEvent` for one rendezvous
/// hold an `Arc` to the *other's* slot as well as their own, so that
/// committing to a transfer is a single atomic state transition visible to
/// both `select` calls rather than a handshake that could race.
#[derive(Clone)]
pub(crate) struct FulfillmentSlot {
    inner: Arc<Mutex<FulfillmentSlotInner>>,
}

impl FulfillmentSlot {
    pub(crate) fn new() -> Self {
        FulfillmentSlot {
            inner: Arc::new(Mutex::new(FulfillmentSlotInner {
                state: SlotState::Fulfillable,
                fulfilled_key: None,
            })),
        }
    }

    /// The address of the underlying mutex, used to establish a consistent
    /// lock order when two slots must be held at once (see
    /// [`lock_ordered`]).
    pub(crate) fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn state(&self) -> SlotState {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.state
    }

    /// Attempt to commit this slot to `key`. Succeeds only if the slot was
    /// still `Fulfillable`.
    pub(crate) fn try_fulfill(&self, key: EventKey) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state != SlotState::Fulfillable {
            return false;
        }
        guard.state = SlotState::Fulfilled;
        guard.fulfilled_key = Some(key);
        true
    }

    /// Permanently close off this slot, e.g. because the event owning it
    /// was canceled or its channel was dropped.
    pub(crate) fn mark_unfulfillable(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state == SlotState::Fulfillable {
            guard.state = SlotState::Unfulfillable;
        }
    }

    pub(crate) fn fulfilled_key(&self) -> Option<EventKey> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.fulfilled_key
    }

    /// Commit two slots to two keys as one atomic step, running `on_commit`
    /// (the actual value transfer) while both slots are still locked, and
    /// only then returns its result. Lock order is by address, so a sitter
    /// locking its own slot then its peer's can never deadlock against a
    /// visitor doing the reverse.
    ///
    /// The value transfer must happen while both fulfillment-slot mutexes
    /// are held: if the slots were committed to `Fulfilled` first and the
    /// transfer ran afterward, a peer `select` call on another thread could
    /// observe `Fulfilled` via its own race-check against this same slot,
    /// and report a winner before the value actually landed in the cargo
    /// cell. Running `on_commit` inside the same critical section both
    /// slots are locked for closes that window. Returns `None` (running
    /// `on_commit` not at all) if either slot had already left
    /// `Fulfillable`.
    pub(crate) fn try_fulfill_pair_with<R>(
        a: &FulfillmentSlot,
        a_key: EventKey,
        b: &FulfillmentSlot,
        b_key: EventKey,
        on_commit: impl FnOnce() -> R,
    ) -> Option<R> {
        if a.address() == b.address() {
            // The same `select` call is trying to pair a channel event with
            // itself (e.g. a send and a recv on the same channel passed to
            // one `select`). The original implementation warns about this
            // exact case causing its blocking handshake to hang forever;
            // here, declining the commit avoids locking the same mutex
            // twice (which `std::sync::Mutex` cannot do at all) rather than
            // silently deadlocking.
            return None;
        }

        let (first, first_key, second, second_key) = if a.address() <= b.address() {
            (a, a_key, b, b_key)
        } else {
            (b, b_key, a, a_key)
        };

        let mut first_guard = first.inner.lock().unwrap_or_else(|e| e.into_inner());
        if first_guard.state != SlotState::Fulfillable {
            return None;
        }

        let mut second_guard = second.inner.lock().unwrap_or_else(|e| e.into_inner());
        if second_guard.state != SlotState::Fulfillable {
            return None;
        }

        let result = on_commit();

        first_guard.state = SlotState::Fulfilled;
        first_guard.fulfilled_key = Some(first_key);
        second_guard.state = SlotState::Fulfilled;
        second_guard.fulfilled_key = Some(second_key);
        Some(result)
    }
}

/// Lock two fulfillment slots in a consistent order (by their mutex's
/// address) regardless of which side calls this, so that a sitter locking
/// its own slot then its peer's can never deadlock against a visitor doing
/// the reverse.
pub(crate) fn lock_ordered<R>(
    a: &FulfillmentSlot,
    b: &FulfillmentSlot,
    f: impl FnOnce(&FulfillmentSlot, &FulfillmentSlot) -> R,
) -> R {
    if a.address() <= b.address() {
        f(a, b)
    } else {
        f(b, a)
    }
}


/// A context a `SelectEvent` carries: its key within the current `select`
/// call, plus the slot shared by every event in that same call.
///
/// Every event in one `select` call is bound to the *same* `fulfillment`
/// slot (one per call, not one per event). That lets a channel rendezvous
/// on a *different* thread's `select` call transition this call's slot
/// straight to `FULFILLED` with a winning key, without this call ever
/// touching `poll` again. Only channel events actually read `fulfillment`;
/// timeout/deadline/file events ignore it.
#[derive(Clone)]
pub(crate) struct EventContext {
    pub(crate) key: EventKey,
    pub(crate) fulfillment: FulfillmentSlot,
}

/// Anything that can be one of the `N` arguments to
/// [`crate::selector::select`].
///
/// A `Selector` drives every event identically: bind it to this call's
/// shared context, ask for an `IoDescriptor` to feed into `poll`, then
/// after `poll` returns, give the event a chance to complete via
/// `fulfill`, and if some other event in the same call won the race, tell
/// this one to `cancel`.
pub trait SelectEvent {
    /// Record this event's position and shared fulfillment slot within
    /// the `select` call about to run it. Called exactly once, before
    /// `file`. Events that never need cross-thread coordination (timeouts,
    /// deadlines, file I/O) can ignore this.
    fn bind(&mut self, _context: EventContext) {}

    /// Mark that this event is now under a `Selector`'s control, so any
    /// "auto-complete on drop" convenience behavior the event offers in
    /// standalone use is suppressed. Called once, after `bind`.
    fn touch(&mut self) {}

    /// Describe what this event wants `poll` to watch, or report that it's
    /// already fulfilled and doesn't need polling this round. Called
    /// exactly once, during setup.
    fn file(&mut self) -> Result<IoDescriptor, Error>;

    /// Called when `poll` reported readiness on what `file` (or the
    /// previous `fulfill`) returned, or when a timeout in `descriptor`
    /// expired. Returns a descriptor telling the selector what happened:
    /// `fulfilled` means this event completed and won; anything else
    /// prescribes further polling.
    fn fulfill(&mut self, descriptor: &IoDescriptor) -> Result<IoDescriptor, Error>;

    /// Called on every event that did *not* win, once another has.
    /// `descriptor` is the last one this event produced. Release any
    /// shared state (fulfillment slots, parked peers) so that abandoning
    /// this attempt can't leave the other side of a rendezvous waiting
    /// forever.
    fn cancel(&mut self, descriptor: &IoDescriptor) -> Result<(), Error>;
}
