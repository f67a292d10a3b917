//! The multiplexing loop that drives one `select` call to completion:
//! setup, poll, dispatch, tie-break, commit, and cancel the losers.

use crate::descriptor::IoDescriptor;
use crate::error::{self, Error, ErrorKind};
use crate::event::{EventContext, FulfillmentSlot, SelectEvent, SlotState};
use crate::random::shuffle;
use crate::time::{self, now};

/// The state of one event across a `select` call's setup/poll/dispatch
/// loop.
struct Record {
    event: Box<dyn SelectEvent>,
    descriptor: IoDescriptor,
    /// Whether `file()` has been called on this record yet. A winner found
    /// mid-setup short-circuits the remaining shuffle order, so records
    /// after it never join any external queue and mustn't be `cancel()`ed.
    initialized: bool,
    /// Whether this record's own `file()`/`fulfill()` call is what produced
    /// `fulfilled=true` (as opposed to some other record's commit flipping
    /// the shared slot while this one was never asked). A record that
    /// fulfilled itself (a timeout firing, a channel event completing its
    /// own rendezvous) needs no further cleanup. A record that becomes the
    /// winner only because a peer on another thread committed the slot out
    /// from under it still needs `cancel()` called so it can detach from
    /// whatever external queue it joined.
    self_fulfilled: bool,
}

/// Multiplex over `events`, blocking until exactly one of them is
/// fulfilled, and return its index.
///
/// On success, every event other than the winner has had
/// [`SelectEvent::cancel`] called on it. On failure, *all* events
/// (including whichever may already have reported readiness) have been
/// canceled; if any of those cancellations themselves fail, the returned
/// error is `ErrorKind::SelectUnwinding` with the original error's message
/// followed by each cancellation failure's message. Either way, the
/// returned error is also recorded in [`error::last_error`] for the
/// calling thread.
pub fn select(events: Vec<Box<dyn SelectEvent>>) -> Result<usize, Error> {
    let result = run(events);
    if let Err(err) = &result {
        error::set_last_error(err.clone());
    }
    result
}

/// A const-generic convenience over [`select`] for callers with a
/// fixed-size, statically typed set of events.
pub fn select_array<const N: usize>(events: [Box<dyn SelectEvent>; N]) -> Result<usize, Error> {
    select(events.into())
}

fn run(events: Vec<Box<dyn SelectEvent>>) -> Result<usize, Error> {
    let slot = FulfillmentSlot::new();
    let mut records: Vec<Record> = events
        .into_iter()
        .map(|event| Record {
            event,
            descriptor: IoDescriptor::idle(),
            initialized: false,
            self_fulfilled: false,
        })
        .collect();

    let outcome = setup_and_run(&mut records, &slot);

    match outcome {
        Ok(winner) => {
            slot.try_fulfill(winner);
            if let Err(unwind_err) = cancel_unfinished(&mut records) {
                return Err(unwind_err);
            }
            Ok(winner)
        }
        Err(original_err) => {
            slot.mark_unfulfillable();
            if let Err(mut unwind_err) = cancel_unfinished(&mut records) {
                unwind_err.append_message(original_err.message());
                return Err(unwind_err);
            }
            Err(original_err)
        }
    }
}

/// Runs setup (shuffled, one `file()` call per event) followed by the
/// poll/dispatch loop, returning the winning event's original argument
/// index (its position in `records`, independent of shuffle order).
fn setup_and_run(records: &mut [Record], slot: &FulfillmentSlot) -> Result<usize, Error> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    shuffle(&mut order);

    for &i in &order {
        records[i].event.bind(EventContext {
            key: i,
            fulfillment: slot.clone(),
        });
        records[i].event.touch();
        records[i].descriptor = records[i].event.file()?;
        records[i].initialized = true;
        if records[i].descriptor.is_fulfilled() {
            records[i].self_fulfilled = true;
        }

        if let Some(winner) = winner_after_setup(records, slot, i) {
            return Ok(winner);
        }
    }

    loop {
        if let Some(winner) = poll_once(records, slot)? {
            return Ok(winner);
        }
    }
}

/// After binding and calling `file()` on record `just_set_up`, check
/// whether it (or a peer committing concurrently through some other
/// record's shared resource) has already produced a winner, without ever
/// calling `poll`.
fn winner_after_setup(records: &[Record], slot: &FulfillmentSlot, just_set_up: usize) -> Option<usize> {
    if records[just_set_up].descriptor.is_fulfilled() {
        return Some(just_set_up);
    }
    if slot.state() == SlotState::Fulfilled {
        return slot.fulfilled_key();
    }
    None
}

/// One iteration of the poll/dispatch loop: build `pollfd`s from the
/// current descriptors, block in `poll`, then dispatch wake-ups to
/// `fulfill`. Returns `Some(winner)` once one is found.
fn poll_once(records: &mut [Record], slot: &FulfillmentSlot) -> Result<Option<usize>, Error> {
    let deadline = now();
    let timeout_ms = time::min_poll_timeout(
        records
            .iter()
            .filter_map(|r| r.descriptor.expires_at())
            .map(|moment| time::millis_until(moment, deadline)),
    );

    let mut pollfds = Vec::new();
    let mut pollfd_owners = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if let Some(fd) = record.descriptor.file() {
            let mut mask = 0;
            if record.descriptor.wants_read() {
                mask |= libc::POLLIN;
            }
            if record.descriptor.wants_write() {
                mask |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd,
                events: mask,
                revents: 0,
            });
            pollfd_owners.push(i);
        }
    }

    let rc = do_poll(&mut pollfds, timeout_ms)?;

    // A peer on another thread may have committed this call's slot while
    // we were blocked in poll(2). That peer's commit didn't run our
    // fulfill(), so the winning record still needs cancel() called on it
    // here, the same as any other loser.
    if slot.state() == SlotState::Fulfilled {
        if let Some(key) = slot.fulfilled_key() {
            if !records[key].descriptor.is_fulfilled() {
                records[key].descriptor.mark_fulfilled();
            }
            return Ok(Some(key));
        }
    }

    if rc == 0 {
        return handle_timeout(records, slot);
    }

    handle_file_event(records, slot, &pollfds, &pollfd_owners)
}

fn handle_timeout(records: &mut [Record], slot: &FulfillmentSlot) -> Result<Option<usize>, Error> {
    let now = now();
    let mut expired: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.descriptor.expires_at().map_or(false, |t| t <= now))
        .map(|(i, _)| i)
        .collect();

    shuffle(&mut expired);

    for i in expired {
        if let Some(winner) = dispatch_fulfill(records, slot, i)? {
            return Ok(Some(winner));
        }
    }
    Ok(None)
}

fn handle_file_event(
    records: &mut [Record],
    slot: &FulfillmentSlot,
    pollfds: &[libc::pollfd],
    pollfd_owners: &[usize],
) -> Result<Option<usize>, Error> {
    let mut ready: Vec<usize> = Vec::new();
    for (slot_idx, &owner) in pollfd_owners.iter().enumerate() {
        let revents = pollfds[slot_idx].revents;
        if revents != 0 {
            records[owner].descriptor.record_revents(revents);
            ready.push(owner);
        }
    }

    shuffle(&mut ready);

    for i in ready {
        if let Some(winner) = dispatch_fulfill(records, slot, i)? {
            return Ok(Some(winner));
        }
    }
    Ok(None)
}

fn dispatch_fulfill(records: &mut [Record], slot: &FulfillmentSlot, i: usize) -> Result<Option<usize>, Error> {
    let next = records[i].event.fulfill(&records[i].descriptor)?;
    records[i].descriptor = next;

    if records[i].descriptor.is_fulfilled() {
        records[i].self_fulfilled = true;
        return Ok(Some(i));
    }
    if slot.state() == SlotState::Fulfilled {
        return Ok(slot.fulfilled_key());
    }
    Ok(None)
}

fn do_poll(pollfds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> Result<libc::c_int, Error> {
    loop {
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc >= 0 {
            return Ok(rc);
        }

        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EINTR) {
            continue;
        }

        return Err(Error::from_last_os_error(ErrorKind::Poll));
    }
}

/// Calls `cancel()` on every record that joined external state in `file()`
/// (`initialized`) but never completed via its own `file()`/`fulfill()`
/// return (`!self_fulfilled`). This includes a record that turns out to be
/// the overall winner because a peer committed the shared slot while this
/// `select` call wasn't looking: `cancel()` still needs to run so that
/// record can detach from its queue. Each `cancel()` implementation checks
/// its own slot first, so it does the right thing whether it's a true
/// loser or a race winner.
fn cancel_unfinished(records: &mut [Record]) -> Result<(), Error> {
    let mut unwinding: Option<Error> = None;

    for record in records.iter_mut() {
        if !record.initialized || record.self_fulfilled {
            continue;
        }

        if let Err(err) = record.event.cancel(&record.descriptor) {
            match &mut unwinding {
                Some(agg) => agg.append_message(err.message()),
                None => unwinding = Some(Error::new(ErrorKind::SelectUnwinding).also(err)),
            }
        }
    }

    match unwinding {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Error {
    /// Build a `SELECT_UNWINDING` error whose message leads with `cause`'s.
    fn also(mut self, cause: Error) -> Error {
        self.append_message(cause.message());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::IoDescriptor;
    use crate::time::now;

    struct AlwaysReady {
        canceled: bool,
    }

    impl SelectEvent for AlwaysReady {
        fn file(&mut self) -> Result<IoDescriptor, Error> {
            Ok(IoDescriptor::already_fulfilled())
        }

        fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
            Ok(IoDescriptor::already_fulfilled())
        }

        fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
            self.canceled = true;
            Ok(())
        }
    }

    #[test]
    fn picks_the_only_ready_event() {
        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(AlwaysReady { canceled: false })];
        let winner = select(events).unwrap();
        assert_eq!(winner, 0);
    }

    #[test]
    fn cancels_every_loser() {
        struct NeverReady {
            canceled: bool,
        }
        impl SelectEvent for NeverReady {
            fn file(&mut self) -> Result<IoDescriptor, Error> {
                Ok(IoDescriptor::idle().with_expiration(now() + std::time::Duration::from_secs(3600)))
            }
            fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
                unreachable!("never polled ready in this test")
            }
            fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
                self.canceled = true;
                Ok(())
            }
        }

        let events: Vec<Box<dyn SelectEvent>> = vec![
            Box::new(AlwaysReady { canceled: false }),
            Box::new(NeverReady { canceled: false }),
        ];
        assert_eq!(select(events).unwrap(), 0);
    }

    #[test]
    fn timeout_event_fulfills_after_expiring() {
        struct ExpiresImmediately;
        impl SelectEvent for ExpiresImmediately {
            fn file(&mut self) -> Result<IoDescriptor, Error> {
                Ok(IoDescriptor::idle().with_expiration(now()))
            }
            fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
                Ok(IoDescriptor::already_fulfilled())
            }
            fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
                Ok(())
            }
        }

        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(ExpiresImmediately)];
        assert_eq!(select(events).unwrap(), 0);
    }

    #[test]
    fn propagates_file_error_and_records_last_error() {
        struct Fails;
        impl SelectEvent for Fails {
            fn file(&mut self) -> Result<IoDescriptor, Error> {
                Err(Error::new(ErrorKind::Other))
            }
            fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
                unreachable!()
            }
            fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
                Ok(())
            }
        }

        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(Fails)];
        let err = select(events).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(error::last_error().kind(), ErrorKind::Other);
    }
}
