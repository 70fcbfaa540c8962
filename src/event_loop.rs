#[cfg(unix)]
pub use self::unix::EventLoop;
#[cfg(windows)]
pub use self::windows::EventLoop;

#[cfg(unix)]
mod unix {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, Weak};
    use std::time::Duration;

    use log::warn;

    use crate::error::Error;
    use crate::event_queue::EventQueue;
    use crate::interest::{EventMode, Interest};
    use crate::poller::{Poller, StatusListener};
    use crate::sys;
    use crate::task::{QueueDelegate, Task, TaskQueue};
    use crate::transport::Transport;

    /// An event loop for I/O: a task queue fused with a poller.
    ///
    /// [`run`] prioritizes tasks over I/O. Each iteration runs one task if
    /// any is queued; otherwise it blocks in the poller and then drains the
    /// loop's [`EventQueue`]. Tasks and quit requests may be posted from
    /// any thread; a self-pipe attached to the poller interrupts the
    /// blocking wait. The read end is level-triggered so one byte in the
    /// pipe is enough to keep waking the loop, while the write end is
    /// edge-triggered so a full pipe still wakes the loop through write
    /// readiness instead of spinning.
    ///
    /// Transports attached through the loop go through the event queue, so
    /// their callbacks are delivered as tasks rather than from inside
    /// `poll`.
    ///
    /// Cloning returns another handle to the same loop.
    ///
    /// [`run`]: EventLoop::run
    #[derive(Clone)]
    pub struct EventLoop {
        inner: Arc<LoopInner>,
    }

    struct LoopInner {
        poller: Poller,
        tasks: TaskQueue,
        events: EventQueue,
        read_pipe: Arc<Transport>,
        write_pipe: Arc<Transport>,
        wakeup: Arc<Wakeup>,
        received_wakeup: AtomicBool,
    }

    impl EventLoop {
        /// Creates an event loop over the given poller, or over a fresh
        /// default poller.
        pub fn new(poller: Option<Poller>) -> Result<EventLoop, Error> {
            let poller = match poller {
                Some(poller) => poller,
                None => Poller::new()?,
            };
            // Posting happens from arbitrary threads; the poller must
            // tolerate structural calls racing its wait.
            poller.enable_thread_safety();

            let (read_pipe, write_pipe) = Transport::pipe()?;

            let inner = Arc::new_cyclic(|me: &Weak<LoopInner>| {
                let delegate: Weak<dyn QueueDelegate> = me.clone();
                LoopInner {
                    poller: poller.clone(),
                    tasks: TaskQueue::with_delegate(delegate),
                    events: EventQueue::new(poller.clone()),
                    read_pipe,
                    write_pipe,
                    wakeup: Arc::new(Wakeup {
                        parent: Mutex::new(me.clone()),
                    }),
                    received_wakeup: AtomicBool::new(false),
                }
            });

            inner.poller.attach(
                &inner.read_pipe,
                inner.wakeup.clone(),
                Interest::READABLE,
                EventMode::Level,
            )?;
            inner.poller.attach(
                &inner.write_pipe,
                inner.wakeup.clone(),
                Interest::WRITABLE,
                EventMode::EdgeOrLevel,
            )?;

            Ok(EventLoop { inner })
        }

        /// Posts a task. Thread-safe; wakes the loop if it is blocked.
        pub fn post_task(&self, task: Box<dyn Task>) {
            self.inner.tasks.post_task(task);
        }

        /// Posts a closure as a task. Thread-safe.
        pub fn post<F: FnMut() + Send + 'static>(&self, f: F) {
            self.inner.tasks.post(f);
        }

        /// Requests the loop to exit. Thread-safe.
        pub fn post_quit(&self) {
            self.inner.tasks.post_quit();
        }

        /// Returns true once [`post_quit`] has been called.
        ///
        /// [`post_quit`]: EventLoop::post_quit
        pub fn should_quit(&self) -> bool {
            self.inner.tasks.should_quit()
        }

        /// Runs until a quit is posted.
        pub fn run(&self) {
            let _sigpipe = sys::SigPipeGuard::new();

            while !self.should_quit() {
                // If this starves I/O, the caller has bigger problems.
                if self.inner.tasks.process_next_task() {
                    continue;
                }

                // Cleared before the wait so we can tell whether the poll
                // returned because another thread posted work.
                self.inner.received_wakeup.store(false, Ordering::Release);

                if let Err(err) = self.inner.poller.poll(None) {
                    warn!("could not poll: {}", err);
                    continue;
                }

                if self.inner.received_wakeup.load(Ordering::Acquire) {
                    continue;
                }

                self.inner.events.dispatch_events(None, 0);
            }
        }

        /// Attaches a transport through the loop's event queue.
        pub fn attach(
            &self,
            transport: &Arc<Transport>,
            listener: Arc<dyn StatusListener>,
            interest: Interest,
            mode: EventMode,
        ) -> Result<(), Error> {
            self.inner.events.attach(transport, listener, interest, mode)
        }

        pub fn detach(&self, transport: &Arc<Transport>) {
            self.inner.events.detach(transport);
        }

        pub fn change_events(
            &self,
            transport: &Arc<Transport>,
            interest: Interest,
        ) -> Result<(), Error> {
            self.inner.events.change_events(transport, interest)
        }

        pub fn add_events(
            &self,
            transport: &Arc<Transport>,
            interest: Interest,
        ) -> Result<(), Error> {
            self.inner.events.add_events(transport, interest)
        }

        pub fn remove_events(
            &self,
            transport: &Arc<Transport>,
            interest: Interest,
        ) -> Result<(), Error> {
            self.inner.events.remove_events(transport, interest)
        }

        /// Drains buffered I/O events without running the full loop.
        pub fn dispatch_events(&self, timelimit: Option<Duration>, nlimit: usize) -> bool {
            self.inner.events.dispatch_events(timelimit, nlimit)
        }

        /// The poller this loop drives.
        pub fn poller(&self) -> Poller {
            self.inner.poller.clone()
        }

        /// Tears the loop down: the wakeup pipe is closed and every
        /// transport attached through the loop is detached.
        pub fn shutdown(&self) {
            *self.inner.wakeup.parent.lock().unwrap() = Weak::new();
            self.inner.write_pipe.close();
            self.inner.read_pipe.close();
            self.inner.events.shutdown();
        }
    }

    impl QueueDelegate for LoopInner {
        fn notify_task(&self) {
            // A failed write with an empty reader still wakes the loop via
            // write readiness on the other pipe end.
            match self.write_pipe.write(&[0]) {
                Ok(_) => {}
                Err(err) => warn!("could not wake event loop: {}", err),
            }

            // Stop the dispatcher so the new task gets a turn. This can
            // race and miss, which is fine; it is a warning shot.
            self.events.break_loop();
        }

        fn notify_quit(&self) {
            self.notify_task();
        }
    }

    impl Drop for LoopInner {
        fn drop(&mut self) {
            *self.wakeup.parent.lock().unwrap() = Weak::new();
            self.write_pipe.close();
            self.read_pipe.close();
        }
    }

    impl std::fmt::Debug for EventLoop {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EventLoop")
                .field("should_quit", &self.should_quit())
                .finish()
        }
    }

    /// Listener for the self-pipe. Reads one byte per readiness so the
    /// level-triggered read end keeps firing while bytes remain.
    struct Wakeup {
        parent: Mutex<Weak<LoopInner>>,
    }

    impl StatusListener for Wakeup {
        fn on_read_ready(&self, transport: &Arc<Transport>) {
            let parent = self.parent.lock().unwrap().upgrade();
            let inner = match parent {
                Some(inner) => inner,
                None => return,
            };

            let mut buf = [0u8; 1];
            if let Err(err) = transport.read(&mut buf) {
                warn!("could not read after wakeup: {}", err);
            }

            inner.received_wakeup.store(true, Ordering::Release);
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, Weak};

    use log::warn;

    use crate::error::Error;
    use crate::sys::{CompletionPort, IoContext, IoListener, IoResult, Transport};
    use crate::task::{QueueDelegate, Task, TaskQueue};

    /// An event loop over a completion port.
    ///
    /// Tasks are prioritized over I/O; cross-thread posts wake the loop by
    /// posting a reusable user completion to the port.
    #[derive(Clone)]
    pub struct EventLoop {
        inner: Arc<LoopInner>,
    }

    struct LoopInner {
        poller: Arc<CompletionPort>,
        tasks: TaskQueue,
        wakeup: Arc<Wakeup>,
        received_wakeup: AtomicBool,
    }

    impl EventLoop {
        pub fn new(poller: Option<Arc<CompletionPort>>) -> Result<EventLoop, Error> {
            let poller = match poller {
                Some(poller) => poller,
                None => CompletionPort::new(1)?,
            };

            let inner = Arc::new_cyclic(|me: &Weak<LoopInner>| {
                let delegate: Weak<dyn QueueDelegate> = me.clone();
                LoopInner {
                    poller,
                    tasks: TaskQueue::with_delegate(delegate),
                    wakeup: Arc::new(Wakeup {
                        parent: Mutex::new(me.clone()),
                        context: Mutex::new(Some(IoContext::new(0))),
                    }),
                    received_wakeup: AtomicBool::new(false),
                }
            });

            Ok(EventLoop { inner })
        }

        pub fn post_task(&self, task: Box<dyn Task>) {
            self.inner.tasks.post_task(task);
        }

        pub fn post<F: FnMut() + Send + 'static>(&self, f: F) {
            self.inner.tasks.post(f);
        }

        pub fn post_quit(&self) {
            self.inner.tasks.post_quit();
        }

        pub fn should_quit(&self) -> bool {
            self.inner.tasks.should_quit()
        }

        /// Attaches a transport directly to the completion port.
        pub fn attach(
            &self,
            transport: &Arc<Transport>,
            listener: Arc<dyn IoListener>,
        ) -> Result<(), Error> {
            self.inner.poller.attach(transport, listener)
        }

        pub fn poller(&self) -> Arc<CompletionPort> {
            self.inner.poller.clone()
        }

        pub fn run(&self) {
            while !self.should_quit() {
                if self.inner.tasks.process_next_task() {
                    continue;
                }

                self.inner.received_wakeup.store(false, Ordering::Release);

                if let Err(err) = self.inner.poller.poll_one(None) {
                    warn!("could not poll: {}", err);
                    continue;
                }
            }
        }

        pub fn shutdown(&self) {
            *self.inner.wakeup.parent.lock().unwrap() = Weak::new();
            self.inner.poller.wait_and_discard_pending_events();
        }
    }

    impl QueueDelegate for LoopInner {
        fn notify_task(&self) {
            Wakeup::signal(&self.wakeup, &self.poller);
        }

        fn notify_quit(&self) {
            Wakeup::signal(&self.wakeup, &self.poller);
        }
    }

    /// Owns the reusable wakeup completion. While the context sits in the
    /// port there is already something to dequeue, so no second post is
    /// needed.
    struct Wakeup {
        parent: Mutex<Weak<LoopInner>>,
        context: Mutex<Option<Arc<IoContext>>>,
    }

    impl Wakeup {
        fn signal(this: &Arc<Wakeup>, poller: &Arc<CompletionPort>) {
            let context = match this.context.lock().unwrap().take() {
                Some(context) => context,
                None => return,
            };

            if let Err(err) = poller.post(&context, this.clone()) {
                warn!("could not post wakeup: {}", err);
                *this.context.lock().unwrap() = Some(context);
            }
        }
    }

    impl IoListener for Wakeup {
        fn on_completed(&self, result: IoResult) {
            // Take the context back for the next signal.
            *self.context.lock().unwrap() = result.context;

            if let Some(inner) = self.parent.lock().unwrap().upgrade() {
                inner.received_wakeup.store(true, Ordering::Release);
            }
        }
    }

    impl std::fmt::Debug for EventLoop {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EventLoop")
                .field("should_quit", &self.should_quit())
                .finish()
        }
    }
}
