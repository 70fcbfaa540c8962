use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::sys::unix::RawEvent;
use crate::transport::flags;

/// Event ports dissociate a descriptor every time an event for it is
/// retrieved, so each slot tracks what it wants and whether it is currently
/// associated.
#[derive(Copy, Clone, Default)]
pub(crate) struct Arm {
    pub events: libc::c_int,
    pub armed: bool,
}

#[derive(Debug)]
pub(crate) struct Queue {
    port: OwnedFd,
}

impl Queue {
    pub fn new() -> io::Result<Queue> {
        let port = unsafe { OwnedFd::from_raw_fd(syscall!(port_create())?) };
        Ok(Queue { port })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    pub fn associate(&self, slot: usize, fd: RawFd, events: libc::c_int) -> io::Result<()> {
        syscall!(port_associate(
            self.port.as_raw_fd(),
            libc::PORT_SOURCE_FD,
            fd as libc::uintptr_t,
            events,
            slot as *mut libc::c_void,
        ))
        .map(|_| ())
    }

    pub fn dissociate(&self, fd: RawFd) {
        let _ = syscall!(port_dissociate(
            self.port.as_raw_fd(),
            libc::PORT_SOURCE_FD,
            fd as libc::uintptr_t,
        ));
    }
}

pub(crate) fn interest_to_events(flags: u8) -> libc::c_int {
    let mut events = 0;
    if flags & flags::READING != 0 {
        events |= libc::POLLIN as libc::c_int;
    }
    if flags & flags::WRITING != 0 {
        events |= libc::POLLOUT as libc::c_int;
    }
    events
}

pub(crate) fn wait(
    port: RawFd,
    events: &mut Vec<libc::port_event>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    if events.len() == events.capacity() {
        events.reserve(events.capacity().max(32));
    }
    events.clear();

    let mut timespec = timeout.map(|to| libc::timespec {
        tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
    });
    let timespec_ptr = timespec
        .as_mut()
        .map(|ts| ts as *mut libc::timespec)
        .unwrap_or(ptr::null_mut());

    // Blocks for at least one event but may return more.
    let mut nget: libc::c_uint = 1;
    let res = syscall!(port_getn(
        port,
        events.as_mut_ptr(),
        events.capacity() as libc::c_uint,
        &mut nget,
        timespec_ptr,
    ));
    match res {
        Ok(_) => {
            // SAFETY: the kernel initialized `nget` entries.
            unsafe { events.set_len(nget as usize) };
            Ok(nget as usize)
        }
        Err(ref err)
            if err.raw_os_error() == Some(libc::ETIME)
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn translate(events: &[libc::port_event], ready: &mut Vec<RawEvent>) {
    for event in events {
        if event.portev_source != libc::PORT_SOURCE_FD as u16 {
            continue;
        }
        let bits = event.portev_events as libc::c_short;
        ready.push(RawEvent {
            key: event.portev_user as usize,
            fd: event.portev_object as RawFd,
            readable: bits & libc::POLLIN != 0,
            writable: bits & libc::POLLOUT != 0,
            error: bits & libc::POLLERR != 0,
            hup: bits & libc::POLLHUP != 0,
        });
    }
}
