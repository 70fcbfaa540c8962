use std::sync::{Arc, Mutex};
use std::time::Duration;

use evio::{
    Error, EventMode, EventQueue, Interest, LibraryError, Poller, StatusListener, Transport,
};

mod util;

use util::{init, socket_pair, Recorder};

/// Records the order in which callbacks arrive.
#[derive(Default)]
struct Sequencer {
    order: Mutex<Vec<&'static str>>,
}

impl Sequencer {
    fn new() -> Arc<Sequencer> {
        Arc::new(Sequencer::default())
    }

    fn order(&self) -> Vec<&'static str> {
        self.order.lock().unwrap().clone()
    }
}

impl StatusListener for Sequencer {
    fn on_read_ready(&self, _transport: &Arc<Transport>) {
        self.order.lock().unwrap().push("read");
    }

    fn on_write_ready(&self, _transport: &Arc<Transport>) {
        self.order.lock().unwrap().push("write");
    }

    fn on_hangup(&self, _transport: &Arc<Transport>) {
        self.order.lock().unwrap().push("hangup");
    }

    fn on_error(&self, _transport: &Arc<Transport>, _error: Error) {
        self.order.lock().unwrap().push("error");
    }
}

#[test]
fn events_buffer_until_dispatched() {
    init();

    let poller = Poller::new().unwrap();
    let queue = EventQueue::new(poller.clone());
    let (reader, writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();

    queue
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    writer.write(b"x").unwrap();

    // Level-triggered readiness fires on every poll, but the delegate is
    // enqueued at most once.
    poller.poll(Some(Duration::from_millis(100))).unwrap();
    poller.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(recorder.reads(), 0);

    assert!(queue.dispatch_next_event());
    assert_eq!(recorder.reads(), 1);
    assert!(!queue.dispatch_next_event());
}

#[test]
fn accumulated_events_forward_in_order() {
    init();

    let poller = Poller::new().unwrap();
    let queue = EventQueue::new(poller.clone());
    let (local, peer) = socket_pair();
    let sequencer = Sequencer::new();

    peer.write(b"z").unwrap();
    queue
        .attach(
            &local,
            sequencer.clone(),
            Interest::READABLE | Interest::WRITABLE,
            EventMode::Level,
        )
        .unwrap();

    poller.poll(Some(Duration::from_millis(100))).unwrap();
    queue.dispatch_events(None, 0);

    assert_eq!(sequencer.order(), vec!["read", "write"]);
}

#[test]
fn hangup_forwards_after_read() {
    init();

    let poller = Poller::new().unwrap();
    let queue = EventQueue::new(poller.clone());
    let (local, peer) = socket_pair();
    let sequencer = Sequencer::new();

    queue
        .attach(&local, sequencer.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    peer.write(b"bye").unwrap();
    peer.close();

    poller.poll(Some(Duration::from_millis(100))).unwrap();
    queue.dispatch_events(None, 0);

    assert_eq!(sequencer.order(), vec!["read", "hangup"]);
    assert!(!local.is_attached());

    // The delegate removed itself; another dispatch does nothing.
    assert!(!queue.dispatch_next_event());
}

#[test]
fn detach_while_enqueued_drops_events() {
    init();

    let poller = Poller::new().unwrap();
    let queue = EventQueue::new(poller.clone());
    let (reader, writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();

    queue
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    writer.write(b"x").unwrap();
    poller.poll(Some(Duration::from_millis(100))).unwrap();

    // The delegate is sitting in the task queue; detaching now must keep
    // its buffered events from ever reaching the listener.
    queue.detach(&reader);
    queue.dispatch_events(None, 0);

    assert_eq!(recorder.reads(), 0);
    assert_eq!(recorder.hangups(), 0);
    assert!(!reader.is_attached());
}

#[test]
fn shutdown_refuses_new_attachments() {
    init();

    let poller = Poller::new().unwrap();
    let queue = EventQueue::new(poller.clone());
    let (reader, _writer) = Transport::pipe().unwrap();

    queue
        .attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level)
        .unwrap();

    queue.shutdown();
    assert!(!reader.is_attached());

    let (other, _w) = Transport::pipe().unwrap();
    match queue.attach(&other, Recorder::new(), Interest::READABLE, EventMode::Level) {
        Err(Error::Library(LibraryError::TransportClosed)) => {}
        other => panic!("expected TransportClosed, got {:?}", other),
    }
}
