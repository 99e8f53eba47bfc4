//! Self-pipe used to wake the poller thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct PipeFds {
    read: OwnedFd,
    write: OwnedFd,
}

/// A non-blocking pipe pair.
///
/// The write end receives one byte per wakeup: from a transport announcing
/// queued events, from the poller asking itself to continue a time-boxed
/// drain, or from a producer asking for teardown. Every operation swallows
/// errors since the poller always re-checks real state after waking up.
pub struct SignalPipe {
    fds: Mutex<Option<PipeFds>>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalPipe {
    pub fn new() -> io::Result<Self> {
        let mut raw: [libc::c_int; 2] = [-1; 2];
        // SAFETY: `raw` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(raw.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(raw[0]), OwnedFd::from_raw_fd(raw[1])) };
        configure(read.as_raw_fd())?;
        configure(write.as_raw_fd())?;

        Ok(Self {
            read_fd: read.as_raw_fd(),
            write_fd: write.as_raw_fd(),
            fds: Mutex::new(Some(PipeFds { read, write })),
        })
    }

    /// Descriptor to watch for readability. Stale once closed.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Descriptor handed to transports for queue event notifications.
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Writes one byte. Never blocks; a full or closed pipe is ignored.
    pub fn signal(&self) {
        if let Some(fds) = self.lock().as_ref() {
            let byte = 1u8;
            // SAFETY: one byte from a valid stack location to an open descriptor.
            unsafe {
                libc::write(fds.write.as_raw_fd(), std::ptr::addr_of!(byte).cast(), 1);
            }
        }
    }

    /// Reads everything currently buffered. Returns the number of bytes read.
    pub fn drain(&self) -> usize {
        let guard = self.lock();
        let Some(fds) = guard.as_ref() else {
            return 0;
        };
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            // SAFETY: reading into a stack buffer of the given length.
            let n = unsafe { libc::read(fds.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                return total;
            }
            total += n as usize;
        }
    }

    /// Closes both ends. Idempotent.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PipeFds>> {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SignalPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipe")
            .field("read_fd", &self.read_fd)
            .field("write_fd", &self.write_fd)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn configure(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own, with integer flag arguments.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Readiness entry for `fd`.
pub(crate) fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Whether a polled entry has something to read (or hung up).
pub(crate) fn is_ready(entry: &libc::pollfd) -> bool {
    entry.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

/// Waits until one of `fds` is readable or `timeout` elapses.
///
/// Returns the number of ready entries; an interrupted wait counts as a timeout.
pub(crate) fn wait_readable(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    for entry in fds.iter_mut() {
        entry.revents = 0;
    }
    // Round up so a sub-millisecond remainder does not turn into a busy loop.
    let millis = timeout.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}
