//! The value type a [`SelectEvent`](crate::event::SelectEvent) hands back to
//! the selector to describe what it wants polled and, after polling, what
//! happened: a set of boolean flags plus a file-or-timeout payload. A
//! descriptor not interested in a file simply carries `None` there.

use std::os::unix::io::RawFd;

use crate::time::Moment;

/// What a [`SelectEvent`](crate::event::SelectEvent) wants the selector to
/// watch for, and, once `poll` returns, what it saw.
#[derive(Debug, Clone, Copy)]
pub struct IoDescriptor {
    file: Option<RawFd>,
    read: bool,
    write: bool,
    /// The absolute moment this event should be treated as ready even if
    /// its file never becomes so. `None` means no timeout.
    expires_at: Option<Moment>,

    fulfilled: bool,
    hangup: bool,
    error: bool,
    invalid: bool,
}

impl IoDescriptor {
    /// A descriptor with no file interest and no timeout; a `SelectEvent`
    /// that's already fulfilled (e.g. a channel rendezvous that completed
    /// without ever needing `poll`) reports this and sets `fulfilled` via
    /// [`IoDescriptor::already_fulfilled`].
    pub fn idle() -> Self {
        IoDescriptor {
            file: None,
            read: false,
            write: false,
            expires_at: None,
            fulfilled: false,
            hangup: false,
            error: false,
            invalid: false,
        }
    }

    /// Watch `fd` for readability.
    pub fn readable(fd: RawFd) -> Self {
        IoDescriptor {
            file: Some(fd),
            read: true,
            ..IoDescriptor::idle()
        }
    }

    /// Watch `fd` for writability.
    pub fn writable(fd: RawFd) -> Self {
        IoDescriptor {
            file: Some(fd),
            write: true,
            ..IoDescriptor::idle()
        }
    }

    /// Treat this event as ready once `moment` passes, independent of any
    /// file interest (or combined with one, for a read/write-with-timeout
    /// event).
    pub fn with_expiration(mut self, moment: Moment) -> Self {
        self.expires_at = Some(moment);
        self
    }

    /// Report that a `SelectEvent` is already fulfilled and doesn't need
    /// `poll` consulted at all this round.
    pub fn already_fulfilled() -> Self {
        IoDescriptor {
            fulfilled: true,
            ..IoDescriptor::idle()
        }
    }

    pub fn file(&self) -> Option<RawFd> {
        self.file
    }

    pub fn wants_read(&self) -> bool {
        self.read
    }

    pub fn wants_write(&self) -> bool {
        self.write
    }

    pub fn expires_at(&self) -> Option<Moment> {
        self.expires_at
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled
    }

    pub fn has_hangup(&self) -> bool {
        self.hangup
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Record what `poll`'s revents said about this descriptor's file.
    ///
    /// `POLLHUP`, `POLLERR`, and `POLLNVAL` are ANDed against the revents
    /// mask individually rather than all ORed together and compared as one
    /// value. ORing them first would let a file with `POLLHUP` alone be
    /// mistaken for also having `POLLERR`.
    pub(crate) fn record_revents(&mut self, revents: libc::c_short) {
        self.hangup = revents & libc::POLLHUP != 0;
        self.error = revents & libc::POLLERR != 0;
        self.invalid = revents & libc::POLLNVAL != 0;
    }

    pub(crate) fn mark_fulfilled(&mut self) {
        self.fulfilled = true;
    }
}
