//! The single-byte wire protocol a parked channel participant's pipe
//! carries.
//!
//! One pipe per parked participant and three messages suffice here: the
//! queue-mutex-guarded commit in [`crate::channel`] already decides a
//! winner before anyone writes to a pipe at all, so the pipe only needs to
//! wake the parked side and tell it how the rendezvous ended.

use std::io::{Read, Write};
use std::os::unix::io::RawFd;

use crate::error::{Error, ErrorKind};
use crate::sys::fd::FileDesc;

/// A message written to a parked participant's pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Message {
    /// The rendezvous completed; the value has already been placed in (or
    /// taken from) the participant's cargo slot.
    Done,
    /// The peer failed while completing the transfer.
    Error,
    /// Not a commit: lets a parked participant recheck its own state
    /// without requiring the visitor to have already finished committing,
    /// breaking the deadlock that would otherwise occur if two threads
    /// try to visit each other's parked participant at the same time.
    Poke,
}

impl Message {
    fn to_byte(self) -> u8 {
        match self {
            Message::Done => b'D',
            Message::Error => b'E',
            Message::Poke => b'P',
        }
    }

    fn from_byte(byte: u8) -> Option<Message> {
        match byte {
            b'D' => Some(Message::Done),
            b'E' => Some(Message::Error),
            b'P' => Some(Message::Poke),
            _ => None,
        }
    }
}

/// Write `message` to `fd`, retrying on `EINTR`. A single byte is always
/// written atomically (well under `PIPE_BUF`), so there's no short-write
/// case to handle.
pub(crate) fn write_message(fd: RawFd, message: Message) -> Result<(), Error> {
    let mut file = unsafe { FileDesc::new(libc::dup(fd)) };
    loop {
        match file.write_all(&[message.to_byte()]) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::with_errno(ErrorKind::ProtocolWrite, err.raw_os_error().unwrap_or(-1))),
        }
    }
}

/// Read one protocol byte from `fd`, retrying on `EINTR`.
pub(crate) fn read_message(fd: RawFd) -> Result<Message, Error> {
    let mut file = unsafe { FileDesc::new(libc::dup(fd)) };
    let mut buf = [0u8; 1];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Err(Error::new(ErrorKind::ProtocolReadEof)),
            Ok(_) => {
                return Message::from_byte(buf[0])
                    .ok_or_else(|| Error::other("unrecognized channel protocol byte"))
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error::with_errno(ErrorKind::ProtocolRead, err.raw_os_error().unwrap_or(-1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::pipe::new_pipe;

    #[test]
    fn done_round_trips() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        write_message(write_fd, Message::Done).unwrap();
        assert_eq!(read_message(read_fd).unwrap(), Message::Done);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn error_round_trips() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        write_message(write_fd, Message::Error).unwrap();
        assert_eq!(read_message(read_fd).unwrap(), Message::Error);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn poke_round_trips() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        write_message(write_fd, Message::Poke).unwrap();
        assert_eq!(read_message(read_fd).unwrap(), Message::Poke);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn reading_from_closed_write_end_is_eof() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        unsafe {
            libc::close(write_fd);
        }
        assert_eq!(read_message(read_fd).unwrap_err().kind(), ErrorKind::ProtocolReadEof);
        unsafe {
            libc::close(read_fd);
        }
    }
}
