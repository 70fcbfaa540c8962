// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use evio::{Error, Poller, StatusListener, Transport};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// Polls until `done` returns true, with a hard deadline so a broken
/// notification path fails the test instead of hanging it.
pub fn poll_until(poller: &Poller, done: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        poller
            .poll(Some(Duration::from_millis(50)))
            .expect("unable to poll");
    }
}

/// A connected `AF_UNIX` stream pair, readable and writable at will.
pub fn socket_pair() -> (Arc<Transport>, Arc<Transport>) {
    let mut fds = [0; 2];
    let rv = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rv, 0, "socketpair failed");
    unsafe {
        (
            Transport::from_raw_fd(fds[0], Default::default()).unwrap(),
            Transport::from_raw_fd(fds[1], Default::default()).unwrap(),
        )
    }
}

/// Counts callbacks and remembers the latest error.
#[derive(Default)]
pub struct Recorder {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub hangups: AtomicUsize,
    pub errors: AtomicUsize,
    pub last_error: Mutex<Option<Error>>,
}

impl Recorder {
    pub fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl StatusListener for Recorder {
    fn on_read_ready(&self, _transport: &Arc<Transport>) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn on_write_ready(&self, _transport: &Arc<Transport>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_hangup(&self, _transport: &Arc<Transport>) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _transport: &Arc<Transport>, error: Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap() = Some(error);
    }
}
