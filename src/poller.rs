#[cfg(any(target_os = "illumos", target_os = "solaris"))]
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::trace;
use slab::Slab;

use crate::error::{Error, LibraryError};
use crate::interest::{EventMode, Interest};
use crate::sys::{self, RawEvent, Scratch};
use crate::transport::{flags, Transport};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sys::epoll as queue_backend;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
use crate::sys::kqueue as queue_backend;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
use crate::sys::port as queue_backend;

/// Receives readiness notifications for an attached transport.
///
/// Callbacks run on the polling thread with the poller's structural lock
/// released, so a listener may attach, detach or change events from inside
/// a callback. Hangups and errors detach the transport before the callback
/// fires, so the listener always observes a terminal state.
///
/// The proxy hooks are used by [`EventQueue`] delegates and can be ignored
/// by ordinary listeners.
///
/// [`EventQueue`]: crate::EventQueue
pub trait StatusListener: Send + Sync {
    /// Data is available for non-blocking reading.
    fn on_read_ready(&self, _transport: &Arc<Transport>) {}

    /// The transport can accept non-blocking writes.
    fn on_write_ready(&self, _transport: &Arc<Transport>) {}

    /// The peer closed the connection. The transport has been detached.
    fn on_hangup(&self, _transport: &Arc<Transport>) {}

    /// The transport entered an error state and has been detached.
    fn on_error(&self, _transport: &Arc<Transport>, _error: Error) {}

    /// A proxying listener has been detached by the poller.
    fn on_proxy_detach(&self) {}

    /// A proxying listener's interest set changed.
    fn on_change_events(&self, _interest: Interest) {}
}

/// The readiness primitive backing a [`Poller`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue,
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    Port,
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    DevPoll,
    Poll,
    Select,
}

impl Backend {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn best() -> Backend {
        Backend::Epoll
    }

    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    fn best() -> Backend {
        Backend::Kqueue
    }

    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    fn best() -> Backend {
        Backend::Port
    }

    #[cfg(not(any(
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
    )))]
    fn best() -> Backend {
        Backend::Poll
    }
}

/// Polls a set of transports for readiness and delivers callbacks.
///
/// A poller manages transports registered via [`attach`], arms the
/// operating system's readiness primitive, and on [`poll`] delivers
/// [`StatusListener`] callbacks for every ready transport.
///
/// # Backends
///
/// | OS              | Default backend | Also available             |
/// |-----------------|-----------------|----------------------------|
/// | Linux, Android  | epoll           | poll, select               |
/// | BSD, macOS, iOS | kqueue          | poll, select               |
/// | illumos, Solaris| event ports     | `/dev/poll`, poll, select  |
///
/// epoll and kqueue provide edge-triggered delivery natively; most of the
/// rest emulate it by stripping the interest bit after each delivery. A
/// read or write that returns would-block re-arms the interest, so the
/// usual edge-triggered discipline of draining until `completed == false`
/// works identically on those backends. `/dev/poll` is the exception: it
/// is level-triggered only, so [`EventMode::EdgeOrLevel`] falls back to
/// level there and [`EventMode::Edge`] is rejected.
///
/// # Threading
///
/// A freshly created poller is single-threaded cooperative: every method
/// must be called from one thread, and `poll` keeps the structural state
/// locked across the kernel wait. After [`enable_thread_safety`],
/// structural calls may come from any thread at any time, including from
/// callbacks, and `poll` snapshots interest state so the kernel wait runs
/// unlocked. `poll` itself is serialized by a dedicated lock in both modes
/// and is never re-entrant.
///
/// [`attach`]: Poller::attach
/// [`poll`]: Poller::poll
/// [`enable_thread_safety`]: Poller::enable_thread_safety
#[derive(Clone)]
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl Poller {
    /// Creates a poller with the best backend for this platform.
    pub fn new() -> Result<Poller, Error> {
        Poller::with_backend(Backend::best())
    }

    /// Creates a poller with an explicit backend.
    pub fn with_backend(backend: Backend) -> Result<Poller, Error> {
        let table = Table::new(backend)?;
        Ok(Poller {
            shared: Arc::new_cyclic(|me| PollerShared {
                me: me.clone(),
                state: Mutex::new(State {
                    slots: Slab::new(),
                    generation: 0,
                    table,
                }),
                scratch: Mutex::new(Scratch::new()),
                thread_safe: AtomicBool::new(false),
            }),
        })
    }

    /// The backend this poller uses.
    pub fn backend(&self) -> Backend {
        self.shared.state.lock().unwrap().table.backend()
    }

    /// Attaches a transport with an initial interest set and trigger mode.
    ///
    /// While attached, the poller holds a strong reference to the transport
    /// and the transport holds the listener. A transport can be attached to
    /// at most one poller; re-attaching without a detach fails with
    /// [`LibraryError::AlreadyAttached`].
    ///
    /// An empty interest set is valid: the transport stays dormant until
    /// interest is added or a blocked read/write re-arms it.
    pub fn attach(
        &self,
        transport: &Arc<Transport>,
        listener: Arc<dyn StatusListener>,
        interest: Interest,
        mode: EventMode,
    ) -> Result<(), Error> {
        self.shared
            .attach_inner(transport, listener, interest, mode, false)
    }

    /// Detaches a transport. Pending callbacks for it in a concurrent poll
    /// batch are suppressed. Detaching a transport that is not attached to
    /// this poller is a no-op.
    pub fn detach(&self, transport: &Arc<Transport>) {
        self.shared.detach_transport(transport);
    }

    /// Replaces the transport's interest set.
    pub fn change_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        self.shared
            .update_events(transport, interest.bits(), EventOp::Set)
    }

    /// Adds to the transport's interest set.
    pub fn add_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        self.shared
            .update_events(transport, interest.bits(), EventOp::Add)
    }

    /// Removes from the transport's interest set.
    pub fn remove_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        self.shared
            .update_events(transport, interest.bits(), EventOp::Remove)
    }

    /// Waits for readiness and delivers callbacks.
    ///
    /// `None` blocks until at least one event or an explicit wakeup; a zero
    /// timeout never blocks. An interrupted wait (`EINTR`) is success with
    /// no events, so callers driving a loop simply poll again.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.shared.poll(timeout)
    }

    /// Allows structural calls from any thread. See the type-level notes.
    pub fn enable_thread_safety(&self) {
        self.shared.thread_safe.store(true, Ordering::Release);
    }

    /// Whether edge-triggered attachments are available, natively or by
    /// emulation.
    pub fn supports_edge_triggering(&self) -> bool {
        self.shared.state.lock().unwrap().table.supports_edge()
    }

    /// Detaches every transport. Proxying listeners are told via
    /// [`StatusListener::on_proxy_detach`] with no locks held.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub(crate) fn shared(&self) -> &Arc<PollerShared> {
        &self.shared
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &self.backend())
            .finish()
    }
}

pub(crate) enum EventOp {
    Set,
    Add,
    Remove,
}

struct PollData {
    transport: Arc<Transport>,
    modified: u64,
}

struct State {
    slots: Slab<PollData>,
    generation: u64,
    table: Table,
}

pub(crate) struct PollerShared {
    me: std::sync::Weak<PollerShared>,
    state: Mutex<State>,
    scratch: Mutex<Scratch>,
    thread_safe: AtomicBool,
}

impl PollerShared {
    pub(crate) fn attach_inner(
        &self,
        transport: &Arc<Transport>,
        listener: Arc<dyn StatusListener>,
        interest: Interest,
        mode: EventMode,
        proxy: bool,
    ) -> Result<(), Error> {
        if transport.is_closed() {
            return Err(Error::Library(LibraryError::TransportClosed));
        }

        let mut st = self.state.lock().unwrap();

        let mode_bit = match mode {
            EventMode::Level => flags::LEVEL,
            EventMode::Edge => {
                if !st.table.supports_edge() {
                    return Err(Error::Library(LibraryError::EdgeTriggeringUnsupported));
                }
                flags::EDGE
            }
            EventMode::EdgeOrLevel => {
                if st.table.supports_edge() {
                    flags::EDGE
                } else {
                    flags::LEVEL
                }
            }
        };

        transport.begin_attach(&self.me)?;
        let fd = transport.raw_fd();
        if fd < 0 {
            transport.abort_attach();
            return Err(Error::Library(LibraryError::TransportClosed));
        }

        let mut bits = interest.bits() | mode_bit;
        if proxy {
            bits |= flags::PROXYING;
        }

        let generation = st.generation;
        let slot = st.slots.insert(PollData {
            transport: transport.clone(),
            modified: generation,
        });

        if let Err(err) = st.table.attach(slot, fd, bits) {
            st.slots.remove(slot);
            transport.abort_attach();
            return Err(err.into());
        }

        transport.finish_attach(slot, listener, bits);
        trace!("attached fd {} in slot {}", fd, slot);
        Ok(())
    }

    pub(crate) fn detach_transport(&self, transport: &Transport) {
        let proxying;
        let listener = {
            let mut st = self.state.lock().unwrap();
            let slot = match self.validate(&st, transport) {
                Some(slot) => slot,
                None => return,
            };
            proxying = transport.flags() & flags::PROXYING != 0;
            self.detach_locked(&mut st, slot)
        };

        if proxying {
            if let Some(listener) = listener {
                listener.on_proxy_detach();
            }
        }
    }

    /// Adds raw interest bits after a blocked read or write. For
    /// edge-triggered attachments on native backends this is usually a
    /// no-op, since delivery never cleared the bit.
    pub(crate) fn add_interest(&self, transport: &Transport, bits: u8) -> Result<(), Error> {
        self.update_events(transport, bits, EventOp::Add)
    }

    pub(crate) fn update_events(
        &self,
        transport: &Transport,
        bits: u8,
        op: EventOp,
    ) -> Result<(), Error> {
        let notify = {
            let mut st = self.state.lock().unwrap();
            if transport.is_closed() {
                return Err(Error::Library(LibraryError::TransportClosed));
            }
            let slot = self
                .validate(&st, transport)
                .ok_or(Error::Library(LibraryError::IncompatibleTransport))?;

            let old = transport.flags();
            let events = match op {
                EventOp::Set => bits & flags::EVENT_MASK,
                EventOp::Add => (old | bits) & flags::EVENT_MASK,
                EventOp::Remove => (old & !bits) & flags::EVENT_MASK,
            };
            let new = (old & !flags::EVENT_MASK) | events;
            if new == old {
                return Ok(());
            }

            st.table.modify(slot, transport.raw_fd(), old, new)?;
            transport.store_event_flags(events);

            if old & flags::PROXYING != 0 {
                transport.listener().map(|l| (l, events))
            } else {
                None
            }
        };

        if let Some((listener, events)) = notify {
            listener.on_change_events(Interest::from_bits(events));
        }
        Ok(())
    }

    pub(crate) fn poll(&self, timeout: Option<Duration>) -> Result<(), Error> {
        // The poll lock also owns the scratch buffers, so at most one
        // thread can be in the kernel wait or the dispatch phase.
        let mut scratch = self.scratch.lock().unwrap();
        let scratch = &mut *scratch;
        scratch.ready.clear();

        self.wait_for_ready(scratch, timeout)?;

        if !scratch.ready.is_empty() {
            self.dispatch(&scratch.ready);
        }
        Ok(())
    }

    fn wait_for_ready(&self, scratch: &mut Scratch, timeout: Option<Duration>) -> Result<(), Error> {
        enum Plan {
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
            Queue(RawFd),
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            DevPoll(RawFd),
            PollCopied,
            Select(libc::fd_set, libc::fd_set, RawFd),
            Done,
        }

        let plan = {
            let mut st = self.state.lock().unwrap();
            match &mut st.table {
                #[cfg(any(target_os = "linux", target_os = "android"))]
                Table::Epoll { queue } => Plan::Queue(queue.raw_fd()),
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                Table::Kqueue { queue } => Plan::Queue(queue.raw_fd()),
                #[cfg(any(target_os = "illumos", target_os = "solaris"))]
                Table::Port { queue, .. } => Plan::Queue(queue.raw_fd()),
                #[cfg(any(target_os = "illumos", target_os = "solaris"))]
                Table::DevPoll { queue, fds } => {
                    // The driver echoes descriptors back, not slots; copy
                    // the mapping out so translation can run unlocked.
                    scratch.fd_slots.clear();
                    scratch
                        .fd_slots
                        .extend(fds.iter().map(|(&fd, &slot)| (fd, slot)));
                    Plan::DevPoll(queue.raw_fd())
                }
                Table::Poll { fds } => {
                    if self.thread_safe.load(Ordering::Acquire) {
                        // Copy the table so arming from other threads is not
                        // blocked while the kernel waits.
                        scratch.pollfds.clear();
                        scratch.pollfds.extend_from_slice(fds);
                        Plan::PollCopied
                    } else {
                        let n = sys::poll::wait(fds, timeout)?;
                        if n > 0 {
                            sys::poll::translate(fds, &mut scratch.ready);
                        }
                        Plan::Done
                    }
                }
                Table::Select { sets } => {
                    let (read, write, watermark) = sets.snapshot(&mut scratch.fd_slots);
                    if watermark == -1 {
                        // Nothing armed; nothing to wait for.
                        Plan::Done
                    } else {
                        Plan::Select(read, write, watermark)
                    }
                }
            }
        };

        match plan {
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
            Plan::Queue(fd) => {
                let n = queue_backend::wait(fd, &mut scratch.queue_events, timeout)?;
                if n > 0 {
                    queue_backend::translate(&scratch.queue_events, &mut scratch.ready);
                }
            }
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Plan::DevPoll(dp) => {
                let n = sys::devpoll::wait(dp, &mut scratch.pollfds, timeout)?;
                if n > 0 {
                    sys::devpoll::translate(&scratch.pollfds, &scratch.fd_slots, &mut scratch.ready);
                }
            }
            Plan::PollCopied => {
                let n = sys::poll::wait(&mut scratch.pollfds, timeout)?;
                if n > 0 {
                    sys::poll::translate(&scratch.pollfds, &mut scratch.ready);
                }
            }
            Plan::Select(mut read, mut write, watermark) => {
                let n = sys::select::wait(&mut read, &mut write, watermark, timeout)?;
                if n > 0 {
                    sys::select::translate(&scratch.fd_slots, &read, &write, &mut scratch.ready);
                }
            }
            Plan::Done => {}
        }
        Ok(())
    }

    /// Delivers callbacks for a batch of ready events.
    ///
    /// The generation counter is bumped once per batch; any slot mutated
    /// during the batch carries the new stamp and later entries for it are
    /// skipped. Per entry the precedence is error, then read, then hangup,
    /// then write, re-checking freshness after every callback.
    fn dispatch(&self, ready: &[RawEvent]) {
        let mut st = self.state.lock().unwrap();
        st.generation += 1;
        let generation = st.generation;

        for ev in ready {
            let transport = match st.slots.get(ev.key) {
                Some(data) if data.modified != generation => data.transport.clone(),
                _ => continue,
            };
            // The slot may have been handed to a different descriptor while
            // the kernel wait was in flight.
            if ev.fd >= 0 && transport.raw_fd() != ev.fd {
                continue;
            }
            st.table.note_delivered(ev.key);

            if ev.error {
                if let Some(listener) = self.detach_locked(&mut st, ev.key) {
                    drop(st);
                    listener.on_error(&transport, Error::Library(LibraryError::UnknownHangup));
                    st = self.state.lock().unwrap();
                }
                continue;
            }

            if ev.readable {
                let (guard, fresh) = self.deliver(st, &transport, ev.key, flags::READING, generation);
                st = guard;
                if !fresh {
                    continue;
                }
                st = self.rearm_delivered(st, &transport, ev.key);
                if !self.is_fresh(&st, &transport, ev.key, generation) {
                    continue;
                }
            }

            if ev.hup {
                if let Some(listener) = self.detach_locked(&mut st, ev.key) {
                    drop(st);
                    listener.on_hangup(&transport);
                    st = self.state.lock().unwrap();
                }
                continue;
            }

            if ev.writable {
                let (guard, fresh) = self.deliver(st, &transport, ev.key, flags::WRITING, generation);
                st = guard;
                if !fresh {
                    continue;
                }
                st = self.rearm_delivered(st, &transport, ev.key);
            }
        }
    }

    /// Runs one readiness callback with the structural lock released.
    ///
    /// Level-triggered attachments only fire while the interest bit is
    /// still set, so a concurrent `change_events` suppresses delivery.
    /// Edge-triggered attachments always fire; on backends that emulate
    /// edge semantics the interest bit is stripped first.
    fn deliver<'a>(
        &'a self,
        mut st: MutexGuard<'a, State>,
        transport: &Arc<Transport>,
        key: usize,
        direction: u8,
        generation: u64,
    ) -> (MutexGuard<'a, State>, bool) {
        let tflags = transport.flags();
        let fire = if tflags & flags::LEVEL != 0 {
            tflags & direction != 0
        } else {
            true
        };

        if fire {
            if tflags & flags::LEVEL == 0 && !st.table.native_edge() {
                st.table.strip(key, transport.raw_fd(), direction);
                transport.clear_flag_bits(direction);
            }

            if let Some(listener) = transport.listener() {
                drop(st);
                if direction == flags::READING {
                    listener.on_read_ready(transport);
                } else {
                    listener.on_write_ready(transport);
                }
                st = self.state.lock().unwrap();
            }
        }

        let fresh = self.is_fresh(&st, transport, key, generation);
        (st, fresh)
    }

    fn is_fresh(
        &self,
        st: &MutexGuard<'_, State>,
        transport: &Arc<Transport>,
        key: usize,
        generation: u64,
    ) -> bool {
        matches!(
            st.slots.get(key),
            Some(data)
                if data.modified != generation
                    && ptr::eq(Arc::as_ptr(&data.transport), Arc::as_ptr(transport))
        )
    }

    /// One-shot backends dissociate a descriptor on every delivery; rearm
    /// whatever interest remains. A rearm failure is terminal for the
    /// attachment and reported like any other transport error.
    fn rearm_delivered<'a>(
        &'a self,
        mut st: MutexGuard<'a, State>,
        transport: &Arc<Transport>,
        key: usize,
    ) -> MutexGuard<'a, State> {
        if let Err(err) = st
            .table
            .rearm_after_delivery(key, transport.raw_fd(), transport.flags())
        {
            if let Some(listener) = self.detach_locked(&mut st, key) {
                drop(st);
                listener.on_error(transport, err.into());
                st = self.state.lock().unwrap();
            }
        }
        st
    }

    fn validate(&self, st: &MutexGuard<'_, State>, transport: &Transport) -> Option<usize> {
        let slot = transport.slot();
        match st.slots.get(slot) {
            Some(data) if ptr::eq(Arc::as_ptr(&data.transport), transport) => Some(slot),
            _ => None,
        }
    }

    fn detach_locked(
        &self,
        st: &mut MutexGuard<'_, State>,
        slot: usize,
    ) -> Option<Arc<dyn StatusListener>> {
        let st = &mut **st;
        let data = st.slots.try_remove(slot)?;
        let fd = data.transport.raw_fd();
        if fd >= 0 {
            st.table.detach(slot, fd, data.transport.flags());
        }
        trace!("detached fd {} from slot {}", fd, slot);
        data.transport.detach()
    }

    pub(crate) fn shutdown(&self) {
        let mut proxies = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let keys: Vec<usize> = st.slots.iter().map(|(key, _)| key).collect();
            for key in keys {
                let proxying = match st.slots.get(key) {
                    Some(data) => data.transport.flags() & flags::PROXYING != 0,
                    None => continue,
                };
                if let Some(listener) = self.detach_locked(&mut st, key) {
                    if proxying {
                        proxies.push(listener);
                    }
                }
            }
        }

        for listener in proxies {
            listener.on_proxy_detach();
        }
    }
}

impl Drop for PollerShared {
    fn drop(&mut self) {
        // No callbacks here; just sever the transports' back-links.
        if let Ok(st) = self.state.get_mut() {
            for (_, data) in st.slots.iter() {
                data.transport.detach();
            }
        }
    }
}

/// Backend interest state. The variants own whatever the primitive needs:
/// a kernel queue descriptor, a slot-indexed `pollfd` table, or descriptor
/// sets plus a watermark.
enum Table {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll { queue: sys::epoll::Queue },
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue { queue: sys::kqueue::Queue },
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    Port {
        queue: sys::port::Queue,
        arms: Vec<sys::port::Arm>,
    },
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    DevPoll {
        queue: sys::devpoll::Queue,
        fds: HashMap<RawFd, usize>,
    },
    Poll { fds: Vec<libc::pollfd> },
    Select { sets: sys::select::Sets },
}

impl Table {
    fn new(backend: Backend) -> Result<Table, Error> {
        let table = match backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Table::Epoll {
                queue: sys::epoll::Queue::new()?,
            },
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue => Table::Kqueue {
                queue: sys::kqueue::Queue::new()?,
            },
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Backend::Port => Table::Port {
                queue: sys::port::Queue::new()?,
                arms: Vec::new(),
            },
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Backend::DevPoll => Table::DevPoll {
                queue: sys::devpoll::Queue::new()?,
                fds: HashMap::new(),
            },
            Backend::Poll => Table::Poll { fds: Vec::new() },
            Backend::Select => Table::Select {
                sets: sys::select::Sets::new(),
            },
        };
        Ok(table)
    }

    fn backend(&self) -> Backend {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Table::Epoll { .. } => Backend::Epoll,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Table::Kqueue { .. } => Backend::Kqueue,
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { .. } => Backend::Port,
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::DevPoll { .. } => Backend::DevPoll,
            Table::Poll { .. } => Backend::Poll,
            Table::Select { .. } => Backend::Select,
        }
    }

    /// Edge-triggered attachments are accepted almost everywhere: epoll and
    /// kqueue provide them natively, most of the rest emulate. `/dev/poll`
    /// is level-triggered only, so edge-or-level attachments fall back to
    /// level on it.
    fn supports_edge(&self) -> bool {
        match self {
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::DevPoll { .. } => false,
            _ => true,
        }
    }

    fn native_edge(&self) -> bool {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Table::Epoll { .. } => true,
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Table::Kqueue { .. } => true,
            _ => false,
        }
    }

    fn attach(&mut self, slot: usize, fd: RawFd, bits: u8) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Table::Epoll { queue } => queue.add(slot, fd, bits),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Table::Kqueue { queue } => queue.update(slot, fd, 0, bits),
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { queue, arms } => {
                if slot >= arms.len() {
                    arms.resize(slot + 1, sys::port::Arm::default());
                }
                let events = sys::port::interest_to_events(bits);
                arms[slot] = sys::port::Arm {
                    events,
                    armed: events != 0,
                };
                if events != 0 {
                    queue.associate(slot, fd, events)?;
                }
                Ok(())
            }
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::DevPoll { queue, fds } => {
                queue.arm(fd, bits)?;
                fds.insert(fd, slot);
                Ok(())
            }
            Table::Poll { fds } => {
                sys::poll::arm(fds, slot, fd, bits);
                Ok(())
            }
            Table::Select { sets } => sets.arm(slot, fd, bits),
        }
    }

    fn modify(&mut self, slot: usize, fd: RawFd, old: u8, new: u8) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Table::Epoll { queue } => queue.modify(slot, fd, new),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Table::Kqueue { queue } => queue.update(slot, fd, old, new),
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { queue, arms } => {
                let _ = old;
                let events = sys::port::interest_to_events(new);
                if events != 0 {
                    queue.associate(slot, fd, events)?;
                    arms[slot] = sys::port::Arm {
                        events,
                        armed: true,
                    };
                } else {
                    if arms[slot].armed {
                        queue.dissociate(fd);
                    }
                    arms[slot] = sys::port::Arm::default();
                }
                Ok(())
            }
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::DevPoll { queue, .. } => {
                let _ = (slot, old);
                queue.rearm(fd, new)
            }
            Table::Poll { fds } => {
                let _ = old;
                sys::poll::set_interest(fds, slot, new);
                Ok(())
            }
            Table::Select { sets } => {
                let _ = old;
                sets.set_interest(fd, new);
                Ok(())
            }
        }
    }

    fn detach(&mut self, slot: usize, fd: RawFd, armed: u8) {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Table::Epoll { queue } => queue.delete(fd),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Table::Kqueue { queue } => queue.delete(slot, fd, armed),
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { queue, arms } => {
                let _ = armed;
                if arms[slot].armed {
                    queue.dissociate(fd);
                }
                arms[slot] = sys::port::Arm::default();
            }
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::DevPoll { queue, fds } => {
                let _ = (slot, armed);
                queue.remove(fd);
                fds.remove(&fd);
            }
            Table::Poll { fds } => sys::poll::disarm(fds, slot),
            Table::Select { sets } => {
                let _ = armed;
                sets.disarm(fd);
            }
        }
    }

    /// Strips one interest bit after a delivery on an emulating backend.
    fn strip(&mut self, slot: usize, fd: RawFd, direction: u8) {
        match self {
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { arms, .. } => {
                arms[slot].events &= !sys::port::interest_to_events(direction);
            }
            Table::Poll { fds } => sys::poll::strip(fds, slot, direction),
            Table::Select { sets } => sets.strip(fd, direction),
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    /// Event ports dissociate on delivery; remember that the slot is no
    /// longer armed.
    fn note_delivered(&mut self, slot: usize) {
        match self {
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { arms, .. } => arms[slot].armed = false,
            _ => {
                let _ = slot;
            }
        }
    }

    /// Re-associates remaining interest on one-shot backends.
    fn rearm_after_delivery(&mut self, slot: usize, fd: RawFd, tflags: u8) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "illumos", target_os = "solaris"))]
            Table::Port { queue, arms } => {
                let events = sys::port::interest_to_events(tflags);
                arms[slot].events = events;
                if events != 0 && !arms[slot].armed {
                    queue.associate(slot, fd, events)?;
                    arms[slot].armed = true;
                }
                Ok(())
            }
            _ => {
                let _ = (slot, fd, tflags);
                Ok(())
            }
        }
    }
}
