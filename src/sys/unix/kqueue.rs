use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::sys::unix::RawEvent;
use crate::transport::flags;

#[derive(Debug)]
pub(crate) struct Queue {
    kq: OwnedFd,
}

// Field types of `struct kevent` differ between the BSDs, so every field
// is written with an inferred cast.
macro_rules! kevent {
    ($fd: expr, $filter: expr, $flags: expr, $slot: expr) => {{
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = $fd as _;
        ev.filter = $filter as _;
        ev.flags = $flags as _;
        ev.udata = $slot as _;
        ev
    }};
}

impl Queue {
    pub fn new() -> io::Result<Queue> {
        let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
        crate::sys::unix::set_cloexec(kq.as_raw_fd())?;
        Ok(Queue { kq })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }

    /// Applies the difference between `old` and `new` interest as a kevent
    /// change list, one entry per filter whose state changed.
    pub fn update(&self, slot: usize, fd: RawFd, old: u8, new: u8) -> io::Result<()> {
        let mut changes: [libc::kevent; 2] = unsafe { std::mem::zeroed() };
        let mut nchanges = 0;

        let extra = if new & flags::EDGE != 0 {
            libc::EV_CLEAR
        } else {
            0
        };

        if (old ^ new) & flags::READING != 0 {
            let kflags = if new & flags::READING != 0 {
                libc::EV_ADD | libc::EV_ENABLE | extra
            } else {
                libc::EV_DELETE
            };
            changes[nchanges] = kevent!(fd, libc::EVFILT_READ, kflags, slot);
            nchanges += 1;
        }
        if (old ^ new) & flags::WRITING != 0 {
            let kflags = if new & flags::WRITING != 0 {
                libc::EV_ADD | libc::EV_ENABLE | extra
            } else {
                libc::EV_DELETE
            };
            changes[nchanges] = kevent!(fd, libc::EVFILT_WRITE, kflags, slot);
            nchanges += 1;
        }

        if nchanges == 0 {
            return Ok(());
        }

        match syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            nchanges as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        )) {
            Ok(_) => Ok(()),
            // Deleting a filter the kernel already dropped (EOF reaps read
            // filters on some kernels) is not an error.
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, slot: usize, fd: RawFd, armed: u8) {
        let _ = self.update(slot, fd, armed, 0);
    }
}

pub(crate) fn wait(
    kq: RawFd,
    events: &mut Vec<libc::kevent>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    if events.len() == events.capacity() {
        events.reserve(events.capacity().max(32));
    }
    events.clear();

    let timespec = timeout.map(|to| libc::timespec {
        tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
    });
    let timespec_ptr = timespec
        .as_ref()
        .map(|ts| ts as *const libc::timespec)
        .unwrap_or(ptr::null());

    let res = syscall!(kevent(
        kq,
        ptr::null(),
        0,
        events.as_mut_ptr(),
        events.capacity() as libc::c_int,
        timespec_ptr,
    ));
    match res {
        Ok(n) => {
            // SAFETY: `kevent` initialized `n` entries.
            unsafe { events.set_len(n as usize) };
            Ok(n as usize)
        }
        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(err),
    }
}

pub(crate) fn translate(events: &[libc::kevent], ready: &mut Vec<RawEvent>) {
    for event in events {
        ready.push(RawEvent {
            key: event.udata as usize,
            fd: event.ident as RawFd,
            readable: event.filter == libc::EVFILT_READ,
            writable: event.filter == libc::EVFILT_WRITE,
            error: event.flags & libc::EV_ERROR != 0,
            hup: event.flags & libc::EV_EOF != 0,
        });
    }
}
