use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) mod kernel;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) mod kqueue;

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub(crate) mod devpoll;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub(crate) mod port;

pub(crate) mod poll;
pub(crate) mod select;

/// A single readiness report, normalized across backends.
///
/// `key` is the slot the backend stored at arming time; `fd` is the
/// descriptor the kernel reported, or `-1` when the backend does not echo
/// it back.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RawEvent {
    pub key: usize,
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

/// Per-poll scratch space, owned by whichever thread holds the poll lock.
pub(crate) struct Scratch {
    pub ready: Vec<RawEvent>,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub queue_events: Vec<libc::epoll_event>,
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub queue_events: Vec<libc::kevent>,
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    pub queue_events: Vec<libc::port_event>,
    pub pollfds: Vec<libc::pollfd>,
    pub fd_slots: Vec<(RawFd, usize)>,
}

impl Scratch {
    pub fn new() -> Scratch {
        Scratch {
            ready: Vec::new(),
            #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "illumos",
                target_os = "solaris"
            ))]
            queue_events: Vec::with_capacity(32),
            pollfds: Vec::new(),
            fd_slots: Vec::new(),
        }
    }
}

/// Converts a poll timeout into milliseconds, rounding up so that a
/// sub-millisecond timeout does not turn into a busy-loop zero unless the
/// caller explicitly asked for zero. `None` means block forever.
pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(to) => to
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(to)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    }
}

/// Creates a non-blocking close-on-exec pipe, returning `[reader, writer]`.
pub(crate) fn pipe_raw() -> io::Result<[RawFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "illumos",
        target_os = "solaris"
    ))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        // macOS lacks `pipe2(2)`, so non-blocking and close-on-exec are set
        // in a second step.
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(err) = set_nonblocking(*fd).and_then(|()| set_cloexec(*fd)) {
                let _ = syscall!(close(fds[0]));
                let _ = syscall!(close(fds[1]));
                return Err(err);
            }
        }
    }

    Ok(fds)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    if flags & libc::FD_CLOEXEC == 0 {
        syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

/// Ignores SIGPIPE for the guard's lifetime. Writes to a hung-up pipe then
/// fail with EPIPE instead of killing the process.
pub(crate) struct SigPipeGuard {
    previous: libc::sighandler_t,
}

impl SigPipeGuard {
    pub fn new() -> SigPipeGuard {
        let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        SigPipeGuard { previous }
    }
}

impl Drop for SigPipeGuard {
    fn drop(&mut self) {
        if self.previous != libc::SIG_ERR {
            unsafe { libc::signal(libc::SIGPIPE, self.previous) };
        }
    }
}
