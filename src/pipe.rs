//! A pool of one-directional OS pipes, reused across rendezvous attempts
//! instead of allocated and torn down each time. Pipes are refcounted with
//! `Arc<Pipe>`; a `Drop` impl returns a pipe to the free list once its last
//! handle goes away, draining any stale bytes first.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::error::Error;
use crate::sys::fd::{drain, FileDesc};
use crate::sys::pipe::new_pipe;

struct PipeHandles {
    read: FileDesc,
    write: FileDesc,
}

struct PoolInner {
    free: Vec<PipeHandles>,
}

/// A small pool of reusable pipes. Each channel created by
/// [`crate::channel::channel`] owns one `PipePool`, shared by every
/// `Sender`/`Receiver` clone of that channel, so pipes a participant
/// finishes with can be recycled by the next participant on the same
/// channel without a fresh `pipe2(2)` call.
#[derive(Clone)]
pub(crate) struct PipePool {
    inner: Arc<Mutex<PoolInner>>,
}

impl PipePool {
    pub(crate) fn new() -> Self {
        PipePool {
            inner: Arc::new(Mutex::new(PoolInner { free: Vec::new() })),
        }
    }

    /// Take a pipe from the free list, or allocate a new one if the list is
    /// empty.
    pub(crate) fn take(&self) -> Result<Pipe, Error> {
        let recycled = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.free.pop()
        };

        let handles = match recycled {
            Some(handles) => handles,
            None => {
                let (read_fd, write_fd) = new_pipe().map_err(|e| {
                    Error::with_errno(
                        crate::error::ErrorKind::CreatePipe,
                        e.raw_os_error().unwrap_or(-1),
                    )
                })?;
                PipeHandles {
                    read: unsafe { FileDesc::new(read_fd) },
                    write: unsafe { FileDesc::new(write_fd) },
                }
            }
        };

        Ok(Pipe {
            handles: Some(handles),
            pool: Arc::downgrade(&self.inner),
        })
    }

    fn give_back(&self, handles: PipeHandles) {
        use std::os::unix::io::AsRawFd;

        if let Err(_err) = drain(handles.read.as_raw_fd()) {
            // A pipe that can't be drained can't be trusted to start empty
            // next time; drop it on the floor rather than recycle it.
            return;
        }

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.free.push(handles);
    }
}

/// A single-reader, single-writer OS pipe, checked out from a [`PipePool`]
/// and returned to it automatically on drop.
///
/// A channel rendezvous typically shares one `Pipe` between a sitter and
/// the visitor that pokes or fulfills it; cloning the surrounding `Arc`
/// (via [`crate::channel`]'s use of `Arc<Pipe>`) is what keeps it alive
/// until both sides are done with it.
pub(crate) struct Pipe {
    handles: Option<PipeHandles>,
    pool: Weak<Mutex<PoolInner>>,
}

impl Pipe {
    pub(crate) fn read_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.handles.as_ref().expect("pipe handles taken").read.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.handles.as_ref().expect("pipe handles taken").write.as_raw_fd()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.take() {
            if let Some(inner) = self.pool.upgrade() {
                PipePool { inner }.give_back(handles);
            }
            // If the pool itself is already gone, the `FileDesc`s close
            // their fds as they're dropped along with `handles`.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn take_allocates_a_working_pipe() {
        let pool = PipePool::new();
        let pipe = pool.take().unwrap();

        let mut write_end = unsafe { FileDesc::new(libc::dup(pipe.write_fd())) };
        write_end.write_all(b"x").unwrap();

        let mut read_end = unsafe { FileDesc::new(libc::dup(pipe.read_fd())) };
        let mut buf = [0u8; 1];
        read_end.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [b'x']);
    }

    #[test]
    fn dropped_pipe_is_recycled() {
        let pool = PipePool::new();
        let first_read_fd = {
            let pipe = pool.take().unwrap();
            pipe.read_fd()
        };

        let second = pool.take().unwrap();
        assert_eq!(second.read_fd(), first_read_fd);
    }
}
