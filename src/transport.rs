use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, LibraryError};
use crate::poller::{PollerShared, StatusListener};
use crate::sys;

/// Internal transport flag bits. The low bits double as the event mask the
/// poller arms, so interest changes are a single mask operation.
pub(crate) mod flags {
    pub const READING: u8 = 0b0000_0001;
    pub const WRITING: u8 = 0b0000_0010;
    pub const EDGE: u8 = 0b0000_0100;
    pub const LEVEL: u8 = 0b0000_1000;
    pub const PROXYING: u8 = 0b0001_0000;
    pub const NO_AUTO_CLOSE: u8 = 0b0010_0000;
    pub const NO_CLOEXEC: u8 = 0b0100_0000;

    pub const EVENT_MASK: u8 = READING | WRITING;
    /// Bits cleared when a transport is detached from its poller.
    pub const CLEAR_MASK: u8 = READING | WRITING | EDGE | LEVEL | PROXYING;
}

/// Options controlling how a wrapped descriptor is managed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportFlags {
    bits: u8,
}

impl TransportFlags {
    /// Do not close the descriptor when the transport is dropped.
    pub const NO_AUTO_CLOSE: TransportFlags = TransportFlags {
        bits: flags::NO_AUTO_CLOSE,
    };

    /// Leave the close-on-exec flag alone during setup.
    pub const NO_CLOEXEC: TransportFlags = TransportFlags {
        bits: flags::NO_CLOEXEC,
    };

    pub const fn union(self, other: TransportFlags) -> TransportFlags {
        TransportFlags {
            bits: self.bits | other.bits,
        }
    }
}

impl std::ops::BitOr for TransportFlags {
    type Output = TransportFlags;

    fn bitor(self, other: TransportFlags) -> TransportFlags {
        self.union(other)
    }
}

/// The outcome of a single read or write.
#[derive(Copy, Clone, Debug, Default)]
pub struct IoResult {
    /// True if the operation completed; false if it would have blocked and
    /// the poller has been asked to report the next readiness transition.
    pub completed: bool,
    /// True if the peer performed an orderly shutdown.
    pub ended: bool,
    /// Bytes transferred. Partial writes are normal.
    pub bytes: usize,
}

/// A byte-oriented endpoint wrapping an operating system descriptor.
///
/// Transports are shared through `Arc`: while attached, the owning poller
/// holds a strong reference in its slot table, and the transport holds a
/// weak reference back plus a strong reference to the listener. At most one
/// poller may hold a transport at a time.
///
/// Descriptors are made non-blocking (and close-on-exec, unless suppressed)
/// before use. When a read or write returns [`IoResult::completed`] `==
/// false`, the transport has already re-armed the corresponding readiness
/// interest with its poller, so the listener will fire again once the
/// descriptor is ready.
pub struct Transport {
    fd: AtomicI32,
    flags: AtomicU8,
    slot: AtomicUsize,
    poller: Mutex<Weak<PollerShared>>,
    listener: Mutex<Option<Arc<dyn StatusListener>>>,
}

impl Transport {
    /// Wraps an owned descriptor, making it non-blocking and close-on-exec.
    /// The descriptor is closed when the transport is dropped or closed.
    pub fn from_fd(fd: OwnedFd) -> Result<Arc<Transport>, Error> {
        // SAFETY: the descriptor is owned and valid.
        unsafe { Transport::from_raw_fd(fd.into_raw_fd(), TransportFlags::default()) }
    }

    /// Wraps a raw descriptor with explicit management flags.
    ///
    /// # Safety
    ///
    /// `fd` must be open, and must stay open for the transport's lifetime
    /// when [`TransportFlags::NO_AUTO_CLOSE`] is set.
    pub unsafe fn from_raw_fd(
        fd: RawFd,
        transport_flags: TransportFlags,
    ) -> Result<Arc<Transport>, Error> {
        let transport = Transport::from_parts(fd, transport_flags.bits);
        transport.setup()?;
        Ok(Arc::new(transport))
    }

    /// Creates a connected pipe, returning `(reader, writer)`. Both ends are
    /// non-blocking and close-on-exec.
    pub fn pipe() -> Result<(Arc<Transport>, Arc<Transport>), Error> {
        let [reader, writer] = sys::pipe_raw()?;
        Ok((
            Arc::new(Transport::from_parts(reader, 0)),
            Arc::new(Transport::from_parts(writer, 0)),
        ))
    }

    fn from_parts(fd: RawFd, bits: u8) -> Transport {
        Transport {
            fd: AtomicI32::new(fd),
            flags: AtomicU8::new(bits),
            slot: AtomicUsize::new(usize::MAX),
            poller: Mutex::new(Weak::new()),
            listener: Mutex::new(None),
        }
    }

    fn setup(&self) -> Result<(), Error> {
        let fd = self.raw_fd();
        sys::set_nonblocking(fd)?;
        if self.flags() & flags::NO_CLOEXEC == 0 {
            sys::set_cloexec(fd)?;
        }
        Ok(())
    }

    /// Attempts to read up to `buf.len()` bytes.
    ///
    /// On success at least one byte was read, or the peer closed the
    /// connection and [`IoResult::ended`] is set. A would-block condition is
    /// not an error: `completed` is false and readiness has been re-armed.
    pub fn read(&self, buf: &mut [u8]) -> Result<IoResult, Error> {
        let fd = self.raw_fd();
        if fd < 0 {
            return Err(Error::Library(LibraryError::TransportClosed));
        }

        let rv = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rv == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                self.read_blocked()?;
                return Ok(IoResult::default());
            }
            return Err(err.into());
        }

        let mut result = IoResult {
            completed: true,
            ..IoResult::default()
        };
        if rv == 0 {
            result.ended = true;
        } else {
            result.bytes = rv as usize;
        }
        Ok(result)
    }

    /// Attempts to write up to `buf.len()` bytes. Partial writes are normal
    /// and reported through [`IoResult::bytes`].
    pub fn write(&self, buf: &[u8]) -> Result<IoResult, Error> {
        let fd = self.raw_fd();
        if fd < 0 {
            return Err(Error::Library(LibraryError::TransportClosed));
        }

        let rv = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if rv == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                self.write_blocked()?;
                return Ok(IoResult::default());
            }
            return Err(err.into());
        }

        Ok(IoResult {
            completed: true,
            ended: false,
            bytes: rv as usize,
        })
    }

    /// Closes the transport, detaching it from its poller first. Safe to
    /// call more than once.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }

        // Detach while the descriptor is still valid so the backend can
        // disarm it.
        if let Some(poller) = self.poller() {
            poller.detach_transport(self);
        }

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let _ = syscall!(close(fd));
        }
    }

    /// Returns whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.raw_fd() < 0
    }

    /// Returns whether the transport is currently attached to a poller.
    pub fn is_attached(&self) -> bool {
        self.poller().is_some()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn read_blocked(&self) -> Result<(), Error> {
        // No lock here; the poller re-validates under its own lock. Users
        // are responsible for synchronizing I/O on a single transport.
        if self.flags() & flags::READING == 0 {
            if let Some(poller) = self.poller() {
                poller.add_interest(self, flags::READING)?;
            }
        }
        Ok(())
    }

    fn write_blocked(&self) -> Result<(), Error> {
        if self.flags() & flags::WRITING == 0 {
            if let Some(poller) = self.poller() {
                poller.add_interest(self, flags::WRITING)?;
            }
        }
        Ok(())
    }

    pub(crate) fn poller(&self) -> Option<Arc<PollerShared>> {
        let weak = self.poller.lock().unwrap().clone();
        weak.upgrade()
    }

    pub(crate) fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    pub(crate) fn store_event_flags(&self, events: u8) {
        let mut current = self.flags();
        loop {
            let new = (current & !flags::EVENT_MASK) | (events & flags::EVENT_MASK);
            match self.flags.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    pub(crate) fn clear_flag_bits(&self, bits: u8) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn StatusListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// Claims the transport for `poller`. Called under the poller's
    /// structural lock, before the slot exists.
    pub(crate) fn begin_attach(&self, poller: &Weak<PollerShared>) -> Result<(), Error> {
        let mut guard = self.poller.lock().unwrap();
        if guard.upgrade().is_some() {
            return Err(Error::Library(LibraryError::AlreadyAttached));
        }
        *guard = poller.clone();
        Ok(())
    }

    pub(crate) fn abort_attach(&self) {
        *self.poller.lock().unwrap() = Weak::new();
    }

    pub(crate) fn finish_attach(
        &self,
        slot: usize,
        listener: Arc<dyn StatusListener>,
        bits: u8,
    ) {
        self.slot.store(slot, Ordering::Release);
        *self.listener.lock().unwrap() = Some(listener);
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Severs the poller link, strips the event and mode flags, and returns
    /// the listener so the caller can deliver a final callback unlocked.
    pub(crate) fn detach(&self) -> Option<Arc<dyn StatusListener>> {
        *self.poller.lock().unwrap() = Weak::new();
        self.flags.fetch_and(!flags::CLEAR_MASK, Ordering::AcqRel);
        self.listener.lock().unwrap().take()
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.flags() & flags::NO_AUTO_CLOSE == 0 {
            self.close();
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("fd", &self.raw_fd())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Transport;
    use crate::error::{Error, LibraryError};

    #[test]
    fn pipe_round_trip() {
        let (reader, writer) = Transport::pipe().unwrap();

        let sent = writer.write(b"hello").unwrap();
        assert!(sent.completed);
        assert_eq!(sent.bytes, 5);

        let mut buf = [0; 16];
        let received = reader.read(&mut buf).unwrap();
        assert!(received.completed);
        assert_eq!(&buf[..received.bytes], b"hello");
    }

    #[test]
    fn empty_pipe_read_would_block() {
        let (reader, _writer) = Transport::pipe().unwrap();
        let mut buf = [0; 16];
        let result = reader.read(&mut buf).unwrap();
        assert!(!result.completed);
        assert_eq!(result.bytes, 0);
    }

    #[test]
    fn read_end_sees_eof() {
        let (reader, writer) = Transport::pipe().unwrap();
        writer.close();
        let mut buf = [0; 16];
        let result = reader.read(&mut buf).unwrap();
        assert!(result.completed);
        assert!(result.ended);
    }

    #[test]
    fn close_is_idempotent() {
        let (reader, _writer) = Transport::pipe().unwrap();
        reader.close();
        reader.close();
        assert!(reader.is_closed());

        let mut buf = [0; 4];
        match reader.read(&mut buf) {
            Err(Error::Library(LibraryError::TransportClosed)) => {}
            other => panic!("expected TransportClosed, got {:?}", other.map(|_| ())),
        }
    }
}
