use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::sys::unix::{kernel, millis, RawEvent};
use crate::transport::flags;

#[derive(Debug)]
pub(crate) struct Queue {
    ep: OwnedFd,
}

impl Queue {
    pub fn new() -> io::Result<Queue> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Queue { ep })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }

    pub fn add(&self, slot: usize, fd: RawFd, flags: u8) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, slot, fd, flags)
    }

    pub fn modify(&self, slot: usize, fd: RawFd, flags: u8) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, slot, fd, flags)
    }

    pub fn delete(&self, fd: RawFd) {
        // The transport may already have closed the descriptor; nothing
        // useful can be done with a failure here.
        let _ = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut(),
        ));
    }

    fn ctl(&self, op: libc::c_int, slot: usize, fd: RawFd, flags: u8) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags_to_epoll(flags),
            u64: slot as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
    }
}

fn flags_to_epoll(flags: u8) -> u32 {
    let mut kind = 0;
    if flags & flags::EDGE != 0 {
        kind |= libc::EPOLLET;
    }
    if kernel::can_use_rdhup() {
        kind |= libc::EPOLLRDHUP;
    }
    if flags & flags::READING != 0 {
        kind |= libc::EPOLLIN;
    }
    if flags & flags::WRITING != 0 {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

/// Waits for events. `EINTR` is reported as zero events so the caller can
/// treat an interrupted wait as an empty poll.
pub(crate) fn wait(
    ep: RawFd,
    events: &mut Vec<libc::epoll_event>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    // Grow the buffer when the previous poll filled it completely.
    if events.len() == events.capacity() {
        events.reserve(events.capacity().max(32));
    }
    events.clear();

    let res = syscall!(epoll_wait(
        ep,
        events.as_mut_ptr(),
        events.capacity() as libc::c_int,
        millis(timeout),
    ));
    match res {
        Ok(n) => {
            // SAFETY: `epoll_wait` initialized `n` entries.
            unsafe { events.set_len(n as usize) };
            Ok(n as usize)
        }
        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(err),
    }
}

pub(crate) fn translate(events: &[libc::epoll_event], ready: &mut Vec<RawEvent>) {
    for event in events {
        let bits = event.events as libc::c_int;
        ready.push(RawEvent {
            key: event.u64 as usize,
            fd: -1,
            readable: bits & libc::EPOLLIN != 0,
            writable: bits & libc::EPOLLOUT != 0,
            error: bits & libc::EPOLLERR != 0,
            hup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
        });
    }
}
