//! The flat error taxonomy shared by every fallible operation in this crate,
//! plus a thread-local "last error" slot mirroring the one `chan::select`
//! historically exposed. `Display` and `std::error::Error` are implemented
//! by hand rather than derived.

use std::cell::RefCell;
use std::fmt;

/// Maximum length, in bytes, of an `Error`'s message. `SELECT_UNWINDING`
/// errors concatenate the original error's message with one or more
/// follow-on messages, so this needs headroom beyond any single message.
const MESSAGE_CAPACITY: usize = 3 * 1024;

/// Negative, numeric error kinds. The numeric values aren't part of the
/// public API (call sites match on the enum), but they're kept negative and
/// stable in declaration order to mirror the C-style codes this taxonomy
/// was distilled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unclassified, or converted from some other failure this crate
    /// doesn't otherwise model.
    Other,
    /// `pipe2(2)` failed while allocating a fresh pipe.
    CreatePipe,
    /// `fcntl(F_GETFL)` failed.
    GetFileFlags,
    /// `fcntl(F_SETFL, ... | O_NONBLOCK)` failed.
    SetFileNonblocking,
    /// `fcntl(F_SETFL, flags)` failed while restoring a file's flags.
    RestoreFileFlags,
    /// Draining a recycled pipe's buffer failed for a reason other than
    /// "no more data" or "interrupted".
    DrainPipe,
    /// A mutex could not be initialized.
    MutexInit,
    /// A mutex could not be locked.
    MutexLock,
    /// A mutex could not be unlocked.
    MutexUnlock,
    /// Reading the monotonic clock failed.
    CurrentTime,
    /// `poll(2)` failed with something other than `EINTR`.
    Poll,
    /// A file-read event's handler reported a failure.
    Read,
    /// A file-write event's handler reported a failure.
    Write,
    /// Writing a protocol byte to a channel pipe failed.
    ProtocolWrite,
    /// Reading a protocol byte from a channel pipe failed.
    ProtocolRead,
    /// Reading a protocol byte hit end-of-file (the peer's pipe was closed
    /// out from under us).
    ProtocolReadEof,
    /// The peer of a channel rendezvous failed while transferring the
    /// value; this side sees `Transfer`, the peer sees its own failure.
    Transfer,
    /// One or more additional errors occurred while canceling the losing
    /// events of a `select` call that was already unwinding from a prior
    /// error.
    SelectUnwinding,
}

impl ErrorKind {
    fn default_message(self) -> &'static str {
        match self {
            ErrorKind::Other => "an error occurred, but no diagnostic message was available",
            ErrorKind::CreatePipe => "unable to allocate a new pipe",
            ErrorKind::GetFileFlags => "unable to get a file descriptor's flags",
            ErrorKind::SetFileNonblocking => "unable to set a file descriptor to non-blocking",
            ErrorKind::RestoreFileFlags => "unable to restore a file descriptor's flags",
            ErrorKind::DrainPipe => "unable to drain a recycled pipe's buffer",
            ErrorKind::MutexInit => "unable to initialize a mutex",
            ErrorKind::MutexLock => "unable to lock a mutex",
            ErrorKind::MutexUnlock => "unable to unlock a mutex",
            ErrorKind::CurrentTime => "unable to read the monotonic clock",
            ErrorKind::Poll => "the poll(2) multiplexing call failed",
            ErrorKind::Read => "a read event's handler failed",
            ErrorKind::Write => "a write event's handler failed",
            ErrorKind::ProtocolWrite => "writing a channel protocol byte failed",
            ErrorKind::ProtocolRead => "reading a channel protocol byte failed",
            ErrorKind::ProtocolReadEof => "reading a channel protocol byte hit end-of-file",
            ErrorKind::Transfer => "the peer of a channel rendezvous failed while transferring the value",
            ErrorKind::SelectUnwinding => "one or more errors occurred while canceling after a prior error",
        }
    }
}

/// An error from this crate: a [`ErrorKind`], an optional positive `errno`,
/// and a bounded, appendable message.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
    message: String,
}

impl Error {
    /// Build an error from a kind alone, using that kind's default message.
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            errno: None,
            message: kind.default_message().to_string(),
        }
    }

    /// Build an error from a kind and the positive `errno` that caused it.
    pub fn with_errno(kind: ErrorKind, errno: i32) -> Error {
        let mut message = kind.default_message().to_string();
        message.push_str(": errno ");
        message.push_str(&errno.to_string());
        truncate(&mut message);

        Error {
            kind,
            errno: Some(errno),
            message,
        }
    }

    /// Build an `ErrorKind::Other` error with a caller-supplied message.
    pub fn other(message: impl Into<String>) -> Error {
        let mut message = message.into();
        truncate(&mut message);

        Error {
            kind: ErrorKind::Other,
            errno: None,
            message,
        }
    }

    /// Convert the last OS error (`errno`) into an `Error` of the given
    /// kind.
    pub(crate) fn from_last_os_error(kind: ErrorKind) -> Error {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(-1);
        Error::with_errno(kind, errno)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The positive system error code associated with this error, if any.
    pub fn system_errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Append `extension` to this error's message, separated by a blank
    /// line, truncating to the message's capacity if necessary.
    pub fn append_message(&mut self, extension: &str) {
        self.message.push_str("\n\n");
        self.message.push_str(extension);
        truncate(&mut self.message);
    }
}

fn truncate(message: &mut String) {
    if message.len() > MESSAGE_CAPACITY {
        let mut boundary = MESSAGE_CAPACITY;
        while !message.is_char_boundary(boundary) {
            boundary -= 1;
        }
        message.truncate(boundary);
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("errno", &self.errno)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.raw_os_error() {
            Some(errno) => Error::with_errno(ErrorKind::Other, errno),
            None => Error::other(err.to_string()),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Record `error` as the current thread's last error.
pub(crate) fn set_last_error(error: Error) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error));
}

/// Return a copy of the most recent error recorded by this crate on the
/// current thread, or a placeholder `Error` if none has been recorded yet.
pub fn last_error() -> Error {
    LAST_ERROR.with(|slot| {
        slot.borrow().clone().unwrap_or_else(|| {
            Error::other(
                "the most recent error local to this thread either does not \
                 exist or could not be recorded",
            )
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_is_used_when_no_errno() {
        let err = Error::new(ErrorKind::Poll);
        assert_eq!(err.kind(), ErrorKind::Poll);
        assert!(err.system_errno().is_none());
        assert!(err.message().contains("poll"));
    }

    #[test]
    fn append_message_concatenates() {
        let mut err = Error::new(ErrorKind::SelectUnwinding);
        err.append_message("first follow-on error");
        err.append_message("second follow-on error");
        assert!(err.message().contains("first follow-on error"));
        assert!(err.message().contains("second follow-on error"));
    }

    #[test]
    fn append_message_truncates_to_capacity() {
        let mut err = Error::new(ErrorKind::Other);
        let long = "x".repeat(MESSAGE_CAPACITY * 2);
        err.append_message(&long);
        assert!(err.message().len() <= MESSAGE_CAPACITY);
    }

    #[test]
    fn last_error_round_trips_per_thread() {
        set_last_error(Error::new(ErrorKind::Transfer));
        assert_eq!(last_error().kind(), ErrorKind::Transfer);
    }

    #[test]
    fn last_error_defaults_when_unset() {
        let result = std::thread::spawn(last_error).join().unwrap();
        assert_eq!(result.kind(), ErrorKind::Other);
    }
}
