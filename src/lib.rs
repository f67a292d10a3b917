//! Go-style rendezvous channels and a multi-way `select` operator over
//! heterogeneous events: channel sends/receives, file reads/writes, relative
//! timeouts, and absolute deadlines.
//!
//! Every channel is unbuffered: a send only completes once paired with a
//! receive, and vice versa. `select` lets a thread wait on several such
//! events at once, atomically committing to exactly one and cancelling the
//! rest, with ties among simultaneously-ready events broken uniformly at
//! random.
//!
//! ```no_run
//! use std::thread;
//! use chansel::channel;
//!
//! let (tx, rx) = channel::<String>();
//! thread::spawn(move || tx.send_blocking("hello".to_string()).unwrap());
//! let greeting = rx.recv_blocking().unwrap();
//! assert_eq!(greeting, "hello");
//! ```
//!
//! Waiting on several events at once:
//!
//! ```no_run
//! use std::time::Duration;
//! use chansel::{channel, select, timeout, SelectEvent};
//!
//! let (_tx, rx) = channel::<i32>();
//! let recv_event = rx.recv();
//! let slot = recv_event.slot();
//!
//! let events: Vec<Box<dyn SelectEvent>> = vec![
//!     Box::new(recv_event),
//!     Box::new(timeout(Duration::from_millis(5))),
//! ];
//! match select(events) {
//!     Ok(0) => println!("received {:?}", slot.take()),
//!     Ok(1) => println!("timed out"),
//!     Ok(_) => unreachable!(),
//!     Err(err) => println!("select failed: {err}"),
//! }
//! ```

mod channel;
mod descriptor;
mod error;
mod event;
mod fileio;
mod pipe;
mod random;
mod selector;
mod sys;
mod time;
mod time_events;

pub use channel::{channel, Receiver, RecvEvent, RecvSlot, SendEvent, Sender};
pub use descriptor::IoDescriptor;
pub use error::{last_error, Error, ErrorKind};
pub use event::SelectEvent;
pub use fileio::{
    nonblocking_read, nonblocking_write, read, write, ReadEvent, ReadHandler, ReadResult,
    WriteEvent, WriteHandler, WriteResult,
};
pub use selector::{select, select_array};
pub use time_events::{deadline, timeout, DeadlineEvent, TimeoutEvent};
