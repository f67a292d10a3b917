use std::io;
use std::os::unix::io::RawFd;

/// Create a new OS pipe, returning `(read_fd, write_fd)`.
///
/// Both ends are opened with `O_CLOEXEC` so that they aren't leaked across
/// `exec`. Neither end is made non-blocking here: the read end is polled via
/// `libc::poll` and only ever read once `poll` reports it ready, and writes
/// of a single protocol byte are always atomic (`PIPE_BUF` guarantees this),
/// so blocking mode is what we want for both.
pub(crate) fn new_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];

    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((fds[0], fds[1]))
}
