use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::error::{Error, ErrorKind};

/// RAII wrapper around a raw file descriptor, closing it on drop.
///
/// Thin wrapper over `std::fs::File` so that `Read`/`Write` come for free;
/// used for the read and write ends of pipes, which aren't otherwise
/// representable as a safe owned type.
#[derive(Debug)]
pub(crate) struct FileDesc(File);

impl FileDesc {
    /// # Safety
    /// `fd` must be a valid, open, and otherwise-unowned file descriptor.
    pub(crate) unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Puts a file descriptor into non-blocking mode for its lifetime, restoring
/// the descriptor's original flags on drop.
///
/// A read or write event needs its file briefly non-blocking so a handler
/// invocation can never itself block the selector thread; the original flags
/// are always put back, including along the panic-unwinding path, since this
/// is an ordinary RAII guard rather than a scope-exit callback that could be
/// skipped.
pub(crate) struct FileNonblockingGuard {
    fd: RawFd,
    original_flags: libc::c_int,
}

impl FileNonblockingGuard {
    pub(crate) fn new(fd: RawFd) -> Result<Self, Error> {
        let original_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if original_flags == -1 {
            return Err(Error::from_last_os_error(ErrorKind::GetFileFlags));
        }

        let nonblocking_flags = original_flags | libc::O_NONBLOCK;
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, nonblocking_flags) };
        if rc == -1 {
            return Err(Error::from_last_os_error(ErrorKind::SetFileNonblocking));
        }

        Ok(FileNonblockingGuard { fd, original_flags })
    }
}

impl Drop for FileNonblockingGuard {
    fn drop(&mut self) {
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.original_flags);
        }
    }
}

/// Temporarily drains a pipe's read end by toggling it non-blocking and
/// reading until `EAGAIN`, restoring the original flags before returning.
///
/// Used when a pipe is returned to the pool: a sitter that poked its peer
/// and then lost the race leaves a stray `POKE` byte behind, and a recycled
/// pipe must start empty for its next use.
pub(crate) fn drain(fd: RawFd) -> Result<(), Error> {
    let guard = FileNonblockingGuard::new(fd)?;
    let mut buf = [0u8; 64];

    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc > 0 {
            continue;
        }
        if rc == 0 {
            break;
        }

        let errno = io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => break,
            Some(libc::EINTR) => continue,
            _ => return Err(Error::from_last_os_error(ErrorKind::DrainPipe)),
        }
    }

    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::pipe::new_pipe;

    #[test]
    fn nonblocking_guard_restores_flags_on_drop() {
        let (read_fd, write_fd) = new_pipe().unwrap();

        let before = unsafe { libc::fcntl(read_fd, libc::F_GETFL) };
        assert_eq!(before & libc::O_NONBLOCK, 0);

        {
            let _guard = FileNonblockingGuard::new(read_fd).unwrap();
            let during = unsafe { libc::fcntl(read_fd, libc::F_GETFL) };
            assert_ne!(during & libc::O_NONBLOCK, 0);
        }

        let after = unsafe { libc::fcntl(read_fd, libc::F_GETFL) };
        assert_eq!(after & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn drain_empties_pending_bytes() {
        let (read_fd, write_fd) = new_pipe().unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        drain(read_fd).unwrap();

        let guard = FileNonblockingGuard::new(read_fd).unwrap();
        let mut buf = [0u8; 1];
        let rc = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(rc, -1);
        drop(guard);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
