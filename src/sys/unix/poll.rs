use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::sys::unix::{kernel, millis, RawEvent};
use crate::transport::flags;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn default_events() -> libc::c_short {
    let mut events = libc::POLLERR | libc::POLLHUP;
    if kernel::can_use_rdhup() {
        events |= libc::POLLRDHUP;
    }
    events
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn default_events() -> libc::c_short {
    let _ = kernel::can_use_rdhup;
    libc::POLLERR | libc::POLLHUP
}

/// Arms `slot` in the slot-indexed pollfd table, growing it as needed.
/// Error and hangup conditions are always requested.
pub(crate) fn arm(fds: &mut Vec<libc::pollfd>, slot: usize, fd: RawFd, flags: u8) {
    if slot >= fds.len() {
        fds.resize(
            slot + 1,
            libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            },
        );
    }
    fds[slot] = libc::pollfd {
        fd,
        events: default_events(),
        revents: 0,
    };
    set_interest(fds, slot, flags);
}

pub(crate) fn set_interest(fds: &mut [libc::pollfd], slot: usize, flags: u8) {
    let events = &mut fds[slot].events;
    *events &= !(libc::POLLIN | libc::POLLOUT);
    if flags & flags::READING != 0 {
        *events |= libc::POLLIN;
    }
    if flags & flags::WRITING != 0 {
        *events |= libc::POLLOUT;
    }
}

pub(crate) fn disarm(fds: &mut [libc::pollfd], slot: usize) {
    fds[slot] = libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    };
}

/// Clears one interest bit after delivery to simulate edge-triggering.
pub(crate) fn strip(fds: &mut [libc::pollfd], slot: usize, interest: u8) {
    if interest & flags::READING != 0 {
        fds[slot].events &= !libc::POLLIN;
    }
    if interest & flags::WRITING != 0 {
        fds[slot].events &= !libc::POLLOUT;
    }
}

/// Waits on the given table. `EINTR` is reported as zero events; `EAGAIN`
/// is retried.
pub(crate) fn wait(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    loop {
        let res = syscall!(poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            millis(timeout),
        ));
        match res {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(ref err) if err.raw_os_error() == Some(libc::EAGAIN) => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn translate(fds: &[libc::pollfd], ready: &mut Vec<RawEvent>) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const HUP: libc::c_short = libc::POLLHUP | libc::POLLRDHUP;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const HUP: libc::c_short = libc::POLLHUP;

    for (slot, pollfd) in fds.iter().enumerate() {
        if pollfd.fd < 0 || pollfd.revents == 0 {
            continue;
        }
        ready.push(RawEvent {
            key: slot,
            fd: pollfd.fd,
            readable: pollfd.revents & libc::POLLIN != 0,
            writable: pollfd.revents & libc::POLLOUT != 0,
            error: pollfd.revents & libc::POLLERR != 0,
            hup: pollfd.revents & HUP != 0,
        });
    }
}
