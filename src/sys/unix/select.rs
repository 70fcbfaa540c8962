use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use crate::sys::unix::RawEvent;
use crate::transport::flags;

/// Interest state for the `select(2)` backend: two descriptor sets, the
/// highest armed descriptor, and a map back from descriptor to slot.
pub(crate) struct Sets {
    read: libc::fd_set,
    write: libc::fd_set,
    watermark: RawFd,
    slot_of: HashMap<RawFd, usize>,
}

impl Sets {
    pub fn new() -> Sets {
        Sets {
            read: zeroed_set(),
            write: zeroed_set(),
            watermark: -1,
            slot_of: HashMap::new(),
        }
    }

    pub fn arm(&mut self, slot: usize, fd: RawFd, flags: u8) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {} is above FD_SETSIZE ({})", fd, libc::FD_SETSIZE),
            ));
        }
        self.slot_of.insert(fd, slot);
        self.set_interest(fd, flags);
        if fd > self.watermark {
            self.watermark = fd;
        }
        Ok(())
    }

    pub fn set_interest(&mut self, fd: RawFd, flags: u8) {
        unsafe {
            if flags & flags::READING != 0 {
                libc::FD_SET(fd, &mut self.read);
            } else {
                libc::FD_CLR(fd, &mut self.read);
            }
            if flags & flags::WRITING != 0 {
                libc::FD_SET(fd, &mut self.write);
            } else {
                libc::FD_CLR(fd, &mut self.write);
            }
        }
    }

    pub fn disarm(&mut self, fd: RawFd) {
        unsafe {
            libc::FD_CLR(fd, &mut self.read);
            libc::FD_CLR(fd, &mut self.write);
        }
        self.slot_of.remove(&fd);

        if fd == self.watermark {
            self.watermark = self.slot_of.keys().copied().max().unwrap_or(-1);
        }
    }

    pub fn strip(&mut self, fd: RawFd, interest: u8) {
        unsafe {
            if interest & flags::READING != 0 {
                libc::FD_CLR(fd, &mut self.read);
            }
            if interest & flags::WRITING != 0 {
                libc::FD_CLR(fd, &mut self.write);
            }
        }
    }

    /// Copies out everything a wait needs, so the kernel call can run
    /// without the structural lock. `select(2)` clobbers its input sets, so
    /// a copy is required in every threading mode.
    pub fn snapshot(&self, pairs: &mut Vec<(RawFd, usize)>) -> (libc::fd_set, libc::fd_set, RawFd) {
        pairs.clear();
        pairs.extend(self.slot_of.iter().map(|(&fd, &slot)| (fd, slot)));
        (self.read, self.write, self.watermark)
    }
}

fn zeroed_set() -> libc::fd_set {
    let mut set = std::mem::MaybeUninit::<libc::fd_set>::zeroed();
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

pub(crate) fn wait(
    read: &mut libc::fd_set,
    write: &mut libc::fd_set,
    watermark: RawFd,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut tv = timeout.map(|to| libc::timeval {
        tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: to.subsec_micros() as libc::suseconds_t,
    });
    let tv_ptr = tv
        .as_mut()
        .map(|tv| tv as *mut libc::timeval)
        .unwrap_or(ptr::null_mut());

    let res = syscall!(select(watermark + 1, read, write, ptr::null_mut(), tv_ptr));
    match res {
        Ok(n) => Ok(n as usize),
        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(err),
    }
}

pub(crate) fn translate(
    pairs: &[(RawFd, usize)],
    read: &libc::fd_set,
    write: &libc::fd_set,
    ready: &mut Vec<RawEvent>,
) {
    for &(fd, slot) in pairs {
        let readable = unsafe { libc::FD_ISSET(fd, read) };
        let writable = unsafe { libc::FD_ISSET(fd, write) };
        if !readable && !writable {
            continue;
        }
        // `select` has no error or hangup reporting; EOF surfaces as a
        // readable descriptor whose read returns zero bytes.
        ready.push(RawEvent {
            key: slot,
            fd,
            readable,
            writable,
            error: false,
            hup: false,
        });
    }
}
