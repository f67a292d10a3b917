//! File-read and file-write selectable events.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;
use std::time::Duration;

use crate::descriptor::IoDescriptor;
use crate::error::{Error, ErrorKind};
use crate::event::SelectEvent;
use crate::sys::fd::FileNonblockingGuard;
use crate::time::now;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

fn next_backoff(current: Duration) -> Duration {
    match current.checked_mul(10) {
        Some(next) if next < MAX_BACKOFF => next,
        _ => MAX_BACKOFF,
    }
}

/// Ignore `SIGPIPE` process-wide, so a write to a pipe with no reader
/// surfaces as `EPIPE` rather than killing the process. Triggered the first
/// time a write event is constructed, since that's the first point a write
/// could actually hit a closed pipe.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Perform one non-blocking read into `buf`, retrying on `EINTR` and
/// reporting "no data right now" (`EAGAIN`/`EWOULDBLOCK`) as `Ok(0)` rather
/// than an error. Intended for use inside a [`ReadHandler`] implementation,
/// which is always called with `fd` already in non-blocking mode.
pub fn nonblocking_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Error> {
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }

        let errno = io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(0),
            other => return Err(Error::with_errno(ErrorKind::Read, other.unwrap_or(-1))),
        }
    }
}

/// Perform one non-blocking write of `buf`, retrying on `EINTR` and
/// reporting "can't make progress right now" (`EAGAIN`/`EWOULDBLOCK`, or
/// `EPIPE` with `SIGPIPE` ignored) as `Ok(0)` so the caller can decide to
/// back off rather than treat it as fatal. Intended for use inside a
/// [`WriteHandler`] implementation.
pub fn nonblocking_write(fd: RawFd, buf: &[u8]) -> Result<usize, Error> {
    loop {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }

        let errno = io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EPIPE) => return Ok(0),
            other => return Err(Error::with_errno(ErrorKind::Write, other.unwrap_or(-1))),
        }
    }
}

/// What a [`ReadHandler`] reports after one invocation: whether enough data
/// has now been read (`Fulfilled`) or whether the event should keep polling
/// for more (`Continue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Fulfilled,
    Continue,
}

/// Controls how many bytes a [`ReadEvent`] reads and when it's done.
/// Implemented for any `FnMut(RawFd) -> Result<ReadResult, Error>`, which
/// should call [`nonblocking_read`] itself to pull bytes into its own
/// buffer.
pub trait ReadHandler {
    fn on_readable(&mut self, fd: RawFd) -> Result<ReadResult, Error>;
}

impl<F> ReadHandler for F
where
    F: FnMut(RawFd) -> Result<ReadResult, Error>,
{
    fn on_readable(&mut self, fd: RawFd) -> Result<ReadResult, Error> {
        self(fd)
    }
}

/// A selectable event that completes once `handler` reports `Fulfilled`
/// for reads on `fd`.
pub struct ReadEvent<H> {
    fd: RawFd,
    handler: H,
}

/// Build a read event: polls `fd` for readability and, on each wake-up,
/// hands it (now temporarily non-blocking) to `handler`.
pub fn read<H: ReadHandler>(fd: RawFd, handler: H) -> ReadEvent<H> {
    ReadEvent { fd, handler }
}

impl<H: ReadHandler + Send + 'static> SelectEvent for ReadEvent<H> {
    fn file(&mut self) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::readable(self.fd))
    }

    fn fulfill(&mut self, _descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
        let guard = FileNonblockingGuard::new(self.fd)?;
        let result = self.handler.on_readable(self.fd);
        drop(guard);

        match result? {
            ReadResult::Fulfilled => Ok(IoDescriptor::already_fulfilled()),
            ReadResult::Continue => Ok(IoDescriptor::readable(self.fd)),
        }
    }

    fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
        Ok(())
    }
}

/// What a [`WriteHandler`] reports after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Everything that needed writing has been written.
    Fulfilled,
    /// Some bytes were written; keep polling for writability.
    Continue,
    /// No bytes could be written this attempt, but more remain; back off
    /// rather than busy-poll.
    Wait,
}

/// Controls how a [`WriteEvent`] writes to its file and when it's done.
/// Implemented for any `FnMut(RawFd) -> Result<WriteResult, Error>`, which
/// should call [`nonblocking_write`] itself.
pub trait WriteHandler {
    fn on_writable(&mut self, fd: RawFd) -> Result<WriteResult, Error>;
}

impl<F> WriteHandler for F
where
    F: FnMut(RawFd) -> Result<WriteResult, Error>,
{
    fn on_writable(&mut self, fd: RawFd) -> Result<WriteResult, Error> {
        self(fd)
    }
}

/// A selectable event that completes once `handler` reports `Fulfilled`
/// for writes on `fd`. Backs off geometrically (1 ms to 1 s) rather than
/// busy-polling when the peer end has hung up or is refusing writes.
pub struct WriteEvent<H> {
    fd: RawFd,
    handler: H,
    broken_pipe_backoff: Duration,
    handler_wait_backoff: Duration,
}

/// Build a write event: polls `fd` for writability and, on each wake-up,
/// hands it (now temporarily non-blocking) to `handler`.
pub fn write<H: WriteHandler>(fd: RawFd, handler: H) -> WriteEvent<H> {
    ignore_sigpipe();
    WriteEvent {
        fd,
        handler,
        broken_pipe_backoff: INITIAL_BACKOFF,
        handler_wait_backoff: INITIAL_BACKOFF,
    }
}

impl<H: WriteHandler + Send + 'static> SelectEvent for WriteEvent<H> {
    fn file(&mut self) -> Result<IoDescriptor, Error> {
        Ok(IoDescriptor::writable(self.fd))
    }

    fn fulfill(&mut self, descriptor: &IoDescriptor) -> Result<IoDescriptor, Error> {
        if descriptor.has_error() || descriptor.has_hangup() {
            let expiry = now() + self.broken_pipe_backoff;
            self.broken_pipe_backoff = next_backoff(self.broken_pipe_backoff);
            return Ok(IoDescriptor::idle().with_expiration(expiry));
        }
        self.broken_pipe_backoff = INITIAL_BACKOFF;

        let guard = FileNonblockingGuard::new(self.fd)?;
        let result = self.handler.on_writable(self.fd);
        drop(guard);

        match result? {
            WriteResult::Fulfilled => Ok(IoDescriptor::already_fulfilled()),
            WriteResult::Continue => {
                self.handler_wait_backoff = INITIAL_BACKOFF;
                Ok(IoDescriptor::writable(self.fd))
            }
            WriteResult::Wait => {
                let expiry = now() + self.handler_wait_backoff;
                self.handler_wait_backoff = next_backoff(self.handler_wait_backoff);
                Ok(IoDescriptor::idle().with_expiration(expiry))
            }
        }
    }

    fn cancel(&mut self, _descriptor: &IoDescriptor) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::select;
    use crate::sys::pipe::new_pipe;

    #[test]
    fn read_event_fulfills_once_enough_bytes_arrive() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        unsafe {
            libc::write(write_fd, b"hi".as_ptr() as *const libc::c_void, 2);
        }

        let mut collected = Vec::new();
        let event = read(read_fd, move |fd: RawFd| {
            let mut buf = [0u8; 16];
            let n = nonblocking_read(fd, &mut buf)?;
            collected.extend_from_slice(&buf[..n]);
            if collected.len() >= 2 {
                Ok(ReadResult::Fulfilled)
            } else {
                Ok(ReadResult::Continue)
            }
        });

        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(event)];
        assert_eq!(select(events).unwrap(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn write_event_fulfills_after_writing() {
        let (read_fd, write_fd) = new_pipe().unwrap();

        let mut remaining: &'static [u8] = b"hi";
        let event = write(write_fd, move |fd: RawFd| {
            let n = nonblocking_write(fd, remaining)?;
            remaining = &remaining[n..];
            if remaining.is_empty() {
                Ok(WriteResult::Fulfilled)
            } else if n == 0 {
                Ok(WriteResult::Wait)
            } else {
                Ok(WriteResult::Continue)
            }
        });

        let events: Vec<Box<dyn SelectEvent>> = vec![Box::new(event)];
        assert_eq!(select(events).unwrap(), 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
