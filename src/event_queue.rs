use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::{Error, LibraryError};
use crate::interest::{EventMode, Interest};
use crate::poller::{Poller, StatusListener};
use crate::task::{Task, TaskQueue};
use crate::transport::Transport;

const READ: u8 = 0b00_0001;
const WRITE: u8 = 0b00_0010;
const HANGUP: u8 = 0b00_0100;
const ERROR: u8 = 0b00_1000;
const QUEUED: u8 = 0b01_0000;
const DETACHED: u8 = 0b10_0000;

/// A proxy over a [`Poller`] that buffers status callbacks as tasks.
///
/// Instead of delivering readiness immediately, each attachment gets a
/// delegate that records event bits and enqueues itself (at most once) on a
/// private task queue. Draining the queue with [`dispatch_events`] then
/// forwards the accumulated events to the user's listener in read, write,
/// hangup order. This lets an event loop make I/O events compete with
/// ordinary tasks on equal footing.
///
/// All operations are expected on one thread; the type is `Sync` only so
/// it can live inside an event loop shared for posting.
///
/// [`dispatch_events`]: EventQueue::dispatch_events
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    poller: Mutex<Option<Poller>>,
    tasks: TaskQueue,
    delegates: Mutex<Vec<Arc<Delegate>>>,
}

impl EventQueue {
    pub fn new(poller: Poller) -> EventQueue {
        EventQueue {
            inner: Arc::new(QueueInner {
                poller: Mutex::new(Some(poller)),
                tasks: TaskQueue::new(),
                delegates: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attaches a transport; the user's listener is wrapped in a delegate
    /// registered with the underlying poller. Fails with
    /// [`LibraryError::TransportClosed`] after [`shutdown`].
    ///
    /// [`shutdown`]: EventQueue::shutdown
    pub fn attach(
        &self,
        transport: &Arc<Transport>,
        listener: Arc<dyn StatusListener>,
        interest: Interest,
        mode: EventMode,
    ) -> Result<(), Error> {
        let poller = self
            .poller()
            .ok_or(Error::Library(LibraryError::TransportClosed))?;

        let delegate = Delegate::new(self.inner.clone(), transport.clone(), listener);
        poller
            .shared()
            .attach_inner(transport, delegate.clone(), interest, mode, true)?;

        self.inner.delegates.lock().unwrap().push(delegate);
        Ok(())
    }

    /// Detaches a transport, dropping any buffered events for it.
    pub fn detach(&self, transport: &Arc<Transport>) {
        let delegate = {
            let delegates = self.inner.delegates.lock().unwrap();
            delegates
                .iter()
                .find(|d| d.wraps(transport))
                .cloned()
        };
        let delegate = match delegate {
            Some(delegate) => delegate,
            None => return,
        };

        // Null the parent first so no further delegate callbacks fire.
        *delegate.parent.lock().unwrap() = None;
        if let Some(poller) = self.poller() {
            poller.detach(transport);
        }
        self.inner.remove_delegate(&delegate);
    }

    pub fn change_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        match self.poller() {
            Some(poller) => poller.change_events(transport, interest),
            None => Err(Error::Library(LibraryError::TransportClosed)),
        }
    }

    pub fn add_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        match self.poller() {
            Some(poller) => poller.add_events(transport, interest),
            None => Err(Error::Library(LibraryError::TransportClosed)),
        }
    }

    pub fn remove_events(&self, transport: &Arc<Transport>, interest: Interest) -> Result<(), Error> {
        match self.poller() {
            Some(poller) => poller.remove_events(transport, interest),
            None => Err(Error::Library(LibraryError::TransportClosed)),
        }
    }

    /// Forwards at most one buffered event; returns whether one ran.
    pub fn dispatch_next_event(&self) -> bool {
        self.inner.tasks.process_next_task()
    }

    /// Drains buffered events with the same limits as
    /// [`TaskQueue::process_tasks`].
    pub fn dispatch_events(&self, timelimit: Option<Duration>, nlimit: usize) -> bool {
        self.inner.tasks.process_tasks(timelimit, nlimit)
    }

    /// Stops an in-progress `dispatch_events` as soon as possible.
    pub fn break_loop(&self) {
        self.inner.tasks.break_loop();
    }

    /// Detaches every delegate and drops pending events. The underlying
    /// poller itself is not shut down.
    pub fn shutdown(&self) {
        let poller = self.inner.poller.lock().unwrap().take();
        let poller = match poller {
            Some(poller) => poller,
            None => return,
        };

        loop {
            let delegate = self.inner.delegates.lock().unwrap().first().cloned();
            let delegate = match delegate {
                Some(delegate) => delegate,
                None => break,
            };

            // Force the queued bit off so the detach path removes the
            // delegate immediately instead of deferring to a run that will
            // never happen.
            delegate.state.lock().unwrap().events &= !QUEUED;

            let transport = delegate.transport.lock().unwrap().clone();
            if let Some(transport) = transport {
                poller.detach(&transport);
            }
            self.inner.remove_delegate(&delegate);
        }
    }

    fn poller(&self) -> Option<Poller> {
        self.inner.poller.lock().unwrap().clone()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("delegates", &self.inner.delegates.lock().unwrap().len())
            .finish()
    }
}

impl QueueInner {
    /// Unlinks a delegate everywhere. Idempotent, so shutdown and callback
    /// paths can race without double removal.
    fn remove_delegate(&self, delegate: &Arc<Delegate>) {
        self.delegates
            .lock()
            .unwrap()
            .retain(|d| !ptr::eq(Arc::as_ptr(d), Arc::as_ptr(delegate)));

        *delegate.parent.lock().unwrap() = None;
        *delegate.transport.lock().unwrap() = None;
        *delegate.forward.lock().unwrap() = None;

        let mut state = delegate.state.lock().unwrap();
        state.events = 0;
        state.error = None;
    }
}

struct DelegateState {
    events: u8,
    error: Option<Error>,
}

/// One attachment's recording listener. Registered with the poller in
/// place of the user's listener, posted to the parent's task queue when
/// events arrive.
struct Delegate {
    me: Weak<Delegate>,
    parent: Mutex<Option<Arc<QueueInner>>>,
    transport: Mutex<Option<Arc<Transport>>>,
    forward: Mutex<Option<Arc<dyn StatusListener>>>,
    state: Mutex<DelegateState>,
}

impl Delegate {
    fn new(
        parent: Arc<QueueInner>,
        transport: Arc<Transport>,
        forward: Arc<dyn StatusListener>,
    ) -> Arc<Delegate> {
        Arc::new_cyclic(|me| Delegate {
            me: me.clone(),
            parent: Mutex::new(Some(parent)),
            transport: Mutex::new(Some(transport)),
            forward: Mutex::new(Some(forward)),
            state: Mutex::new(DelegateState {
                events: 0,
                error: None,
            }),
        })
    }

    fn wraps(&self, transport: &Arc<Transport>) -> bool {
        match &*self.transport.lock().unwrap() {
            Some(t) => Arc::ptr_eq(t, transport),
            None => false,
        }
    }

    /// Records an event bit and enqueues the delegate if it is not already
    /// sitting in the task queue.
    fn record(&self, bit: u8, error: Option<Error>) {
        {
            let mut state = self.state.lock().unwrap();
            state.events |= bit;
            if error.is_some() {
                state.error = error;
            }
            if state.events & QUEUED != 0 {
                return;
            }
            state.events |= QUEUED;
        }

        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        let parent = self.parent.lock().unwrap().clone();
        match parent {
            Some(parent) => parent.tasks.post_task(Box::new(DelegateTask(me))),
            None => {
                // Detached in the meantime; nothing will ever run us.
                self.state.lock().unwrap().events &= !QUEUED;
            }
        }
    }

    fn run(this: &Arc<Delegate>) {
        let (events, error) = {
            let mut state = this.state.lock().unwrap();
            state.events &= !QUEUED;
            let events = state.events;
            let error = state.error.take();
            // Forwarded readiness is consumed; terminal bits stay for the
            // removal below.
            state.events &= !(READ | WRITE);
            (events, error)
        };

        let parent = match this.parent.lock().unwrap().clone() {
            Some(parent) => parent,
            // Detach() ran while we were enqueued.
            None => return,
        };
        let transport = this.transport.lock().unwrap().clone();
        let forward = this.forward.lock().unwrap().clone();
        let (transport, forward) = match (transport, forward) {
            (Some(transport), Some(forward)) => (transport, forward),
            _ => return,
        };

        if events & READ != 0 {
            forward.on_read_ready(&transport);
        }
        if events & WRITE != 0 {
            forward.on_write_ready(&transport);
        }

        if events & (HANGUP | ERROR | DETACHED) != 0 {
            if events & ERROR != 0 {
                forward.on_error(
                    &transport,
                    error.unwrap_or(Error::Library(LibraryError::UnknownHangup)),
                );
            } else {
                forward.on_hangup(&transport);
            }
            parent.remove_delegate(this);
        }
    }
}

impl StatusListener for Delegate {
    fn on_read_ready(&self, _transport: &Arc<Transport>) {
        self.record(READ, None);
    }

    fn on_write_ready(&self, _transport: &Arc<Transport>) {
        self.record(WRITE, None);
    }

    fn on_hangup(&self, _transport: &Arc<Transport>) {
        self.record(HANGUP, None);
    }

    fn on_error(&self, _transport: &Arc<Transport>, error: Error) {
        self.record(ERROR, Some(error));
    }

    fn on_proxy_detach(&self) {
        let parent = self.parent.lock().unwrap().clone();
        let parent = match parent {
            // The parent is detaching us itself; it finishes the job.
            None => return,
            Some(parent) => parent,
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.events & QUEUED != 0 {
                // Keep the queued task alive; it fires hangup and removes
                // us when it runs.
                state.events = DETACHED | QUEUED;
                state.error = None;
                return;
            }
        }

        if let Some(me) = self.me.upgrade() {
            parent.remove_delegate(&me);
        }
    }

    fn on_change_events(&self, interest: Interest) {
        let mut keep = 0;
        if interest.is_readable() {
            keep |= READ;
        }
        if interest.is_writable() {
            keep |= WRITE;
        }
        // Recorded readiness the caller no longer wants must not be
        // forwarded.
        let mut state = self.state.lock().unwrap();
        state.events &= keep | !(READ | WRITE);
    }
}

struct DelegateTask(Arc<Delegate>);

impl Task for DelegateTask {
    fn run(&mut self) {
        Delegate::run(&self.0);
    }
}
