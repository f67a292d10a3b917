//! End-to-end rendezvous and `select` scenarios, driven through the public
//! API rather than `#[cfg(test)]` module internals.

use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use chansel::{channel, read, select, timeout, ReadResult, SelectEvent};

/// Scenario 1: a single sender and a single receiver on separate threads
/// rendezvous exactly once, and each side's `select` reports index 0.
#[test]
fn single_pair_rendezvous() {
    let (tx, rx) = channel::<String>();

    let sender = thread::spawn(move || tx.send_blocking("foo".to_string()).unwrap());
    let value = rx.recv_blocking().unwrap();

    assert_eq!(value, "foo");
    sender.join().unwrap();
}

/// Scenario 2: two threads hold a channel in each direction (swapped
/// relative to each other) and exchange three words per direction using
/// `select` over a send and a recv each iteration.
#[test]
fn multiplexed_send_recv_loop() {
    let (a_to_b_tx, a_to_b_rx) = channel::<&'static str>();
    let (b_to_a_tx, b_to_a_rx) = channel::<&'static str>();
    let words = ["foo", "bar", "baz"];

    // Each thread keeps offering its next unsent word and a recv slot to
    // `select` until both the 3 sends and the 3 receives have gone through;
    // whichever of the two a given call didn't pick just gets retried next
    // time around, so no word is ever dropped on a losing `select`.
    fn run(
        tx: chansel::Sender<&'static str>,
        rx: chansel::Receiver<&'static str>,
        words: [&'static str; 3],
    ) -> Vec<&'static str> {
        let mut next_send = 0;
        let mut received = Vec::new();

        while next_send < words.len() || received.len() < words.len() {
            let mut events: Vec<Box<dyn SelectEvent>> = Vec::new();
            let send_idx = if next_send < words.len() {
                events.push(Box::new(tx.send(words[next_send])) as Box<dyn SelectEvent>);
                Some(events.len() - 1)
            } else {
                None
            };
            let recv_slot;
            let recv_idx = if received.len() < words.len() {
                let recv_event = rx.recv();
                recv_slot = Some(recv_event.slot());
                events.push(Box::new(recv_event));
                Some(events.len() - 1)
            } else {
                recv_slot = None;
                None
            };

            let winner = select(events).unwrap();
            if Some(winner) == send_idx {
                next_send += 1;
            } else if Some(winner) == recv_idx {
                received.push(recv_slot.unwrap().take().unwrap());
            }
        }
        received
    }

    let a = thread::spawn(move || run(a_to_b_tx, b_to_a_rx, words));
    let b = thread::spawn(move || run(b_to_a_tx, a_to_b_rx, words));

    let mut a_received = a.join().unwrap();
    let mut b_received = b.join().unwrap();
    a_received.sort();
    b_received.sort();

    let mut expected = words.to_vec();
    expected.sort();
    assert_eq!(a_received, expected);
    assert_eq!(b_received, expected);
}

/// Scenario 3: a timeout wins over an idle channel with no sender.
#[test]
fn timeout_wins_over_idle_channel() {
    let (_tx, rx) = channel::<i32>();

    let recv_event = rx.recv();
    let slot = recv_event.slot();
    let timeout_event = timeout(Duration::from_millis(5));

    let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(recv_event), Box::new(timeout_event)];
    let started = std::time::Instant::now();
    let winner = select(events).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(winner, 1);
    assert!(elapsed >= Duration::from_millis(5));
    assert!(elapsed < Duration::from_millis(200));
    assert_eq!(slot.take(), None);
}

/// Scenario 4: a read event on an empty pipe with no writer loses to a
/// timeout.
#[test]
fn read_with_timeout_on_empty_pipe() {
    let (read_fd, write_fd) = unsafe {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        (fds[0], fds[1])
    };

    let read_event = read(read_fd, |fd: RawFd| {
        let mut buf = [0u8; 16];
        let n = chansel::nonblocking_read(fd, &mut buf)?;
        if n > 0 {
            Ok(ReadResult::Fulfilled)
        } else {
            Ok(ReadResult::Continue)
        }
    });
    let timeout_event = timeout(Duration::from_millis(100));

    let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(read_event), Box::new(timeout_event)];
    let winner = select(events).unwrap();
    assert_eq!(winner, 1);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
