use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::sys::unix::{millis, RawEvent};
use crate::transport::flags;

// From <sys/devpoll.h>; the libc crate does not expose the driver's ioctl
// interface.
const POLLREMOVE: libc::c_short = 0x0800;
const DP_POLL: libc::c_int = 0xd001;

#[repr(C)]
struct DvPoll {
    dp_fds: *mut libc::pollfd,
    dp_nfds: libc::c_int,
    dp_timeout: libc::c_int,
}

/// The `/dev/poll` driver: interest is armed by writing `pollfd` records
/// to the device and harvested with the `DP_POLL` ioctl. Written event
/// bits accumulate in the kernel set, so changing interest removes the
/// descriptor first and re-adds what remains.
#[derive(Debug)]
pub(crate) struct Queue {
    dp: OwnedFd,
}

impl Queue {
    pub fn new() -> io::Result<Queue> {
        let path = b"/dev/poll\0";
        let fd = syscall!(open(path.as_ptr().cast(), libc::O_RDWR))?;
        let dp = unsafe { OwnedFd::from_raw_fd(fd) };
        crate::sys::unix::set_cloexec(dp.as_raw_fd())?;
        Ok(Queue { dp })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.dp.as_raw_fd()
    }

    pub fn arm(&self, fd: RawFd, flags: u8) -> io::Result<()> {
        self.write_ctl(fd, interest_to_poll(flags))
    }

    pub fn rearm(&self, fd: RawFd, flags: u8) -> io::Result<()> {
        self.write_ctl(fd, POLLREMOVE)?;
        self.write_ctl(fd, interest_to_poll(flags))
    }

    pub fn remove(&self, fd: RawFd) {
        // The descriptor may already be gone; nothing useful can be done
        // with a failure here.
        let _ = self.write_ctl(fd, POLLREMOVE);
    }

    fn write_ctl(&self, fd: RawFd, events: libc::c_short) -> io::Result<()> {
        let pe = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rv = syscall!(write(
            self.dp.as_raw_fd(),
            &pe as *const _ as *const libc::c_void,
            mem::size_of::<libc::pollfd>(),
        ))?;
        if rv as usize != mem::size_of::<libc::pollfd>() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write to /dev/poll did not complete",
            ));
        }
        Ok(())
    }
}

fn interest_to_poll(flags: u8) -> libc::c_short {
    let mut events = 0;
    if flags & flags::READING != 0 {
        events |= libc::POLLIN;
    }
    if flags & flags::WRITING != 0 {
        events |= libc::POLLOUT;
    }
    events
}

pub(crate) fn wait(
    dp: RawFd,
    events: &mut Vec<libc::pollfd>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    if events.len() == events.capacity() {
        events.reserve(events.capacity().max(32));
    }
    events.clear();

    let mut params = DvPoll {
        dp_fds: events.as_mut_ptr(),
        dp_nfds: events.capacity() as libc::c_int,
        dp_timeout: millis(timeout),
    };

    let res = syscall!(ioctl(dp, DP_POLL as _, &mut params));
    match res {
        Ok(n) => {
            // SAFETY: the driver filled `n` entries.
            unsafe { events.set_len(n as usize) };
            Ok(n as usize)
        }
        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(err),
    }
}

pub(crate) fn translate(
    events: &[libc::pollfd],
    fd_slots: &[(RawFd, usize)],
    ready: &mut Vec<RawEvent>,
) {
    for pe in events {
        if pe.revents == 0 {
            continue;
        }
        let slot = match fd_slots.iter().find(|(fd, _)| *fd == pe.fd) {
            Some(&(_, slot)) => slot,
            None => continue,
        };
        ready.push(RawEvent {
            key: slot,
            fd: pe.fd,
            readable: pe.revents & libc::POLLIN != 0,
            writable: pe.revents & libc::POLLOUT != 0,
            error: pe.revents & libc::POLLERR != 0,
            hup: pe.revents & libc::POLLHUP != 0,
        });
    }
}
