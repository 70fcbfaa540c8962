use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evio::{Backend, Error, EventMode, Interest, LibraryError, Poller, StatusListener, Transport};

mod util;

use util::{assert_send, assert_sync, init, poll_until, socket_pair, Recorder};

#[test]
fn is_send_and_sync() {
    assert_send::<Poller>();
    assert_sync::<Poller>();
    assert_send::<Transport>();
    assert_sync::<Transport>();
}

#[test]
fn pipe_read_write_hangup() {
    init();

    let poller = Poller::new().expect("unable to create poller");
    let (reader, writer) = Transport::pipe().expect("unable to create pipe");

    let read_side = Recorder::new();
    let write_side = Recorder::new();

    poller
        .attach(&reader, read_side.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();
    poller
        .attach(&writer, write_side.clone(), Interest::WRITABLE, EventMode::Level)
        .unwrap();

    // An empty pipe is immediately writable.
    poll_until(&poller, || write_side.writes() > 0, "write readiness");
    assert_eq!(read_side.reads(), 0);

    let sent = writer.write(b"hello").unwrap();
    assert!(sent.completed);
    assert_eq!(sent.bytes, 5);

    poll_until(&poller, || read_side.reads() > 0, "read readiness");

    let mut buf = [0; 16];
    let received = reader.read(&mut buf).unwrap();
    assert!(received.completed);
    assert_eq!(&buf[..received.bytes], b"hello");

    // Closing the write end must surface exactly one hangup on the reader.
    writer.close();
    poll_until(&poller, || read_side.hangups() > 0, "hangup");
    assert_eq!(read_side.hangups(), 1);
    assert!(!reader.is_attached());

    // The slot is gone; further polls deliver nothing new for it.
    poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(read_side.hangups(), 1);
}

#[test]
fn zero_timeout_never_blocks() {
    init();

    let poller = Poller::new().unwrap();
    let (reader, _writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(recorder.reads(), 0);
}

#[test]
fn attach_twice_fails() {
    init();

    let poller = Poller::new().unwrap();
    let other = Poller::new().unwrap();
    let (reader, _writer) = Transport::pipe().unwrap();

    poller
        .attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level)
        .unwrap();

    for target in [&poller, &other] {
        match target.attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level) {
            Err(Error::Library(LibraryError::AlreadyAttached)) => {}
            other => panic!("expected AlreadyAttached, got {:?}", other),
        }
    }

    poller.detach(&reader);
    assert!(!reader.is_attached());
    poller
        .attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level)
        .unwrap();
}

#[test]
fn interest_changes_control_delivery() {
    init();

    let poller = Poller::new().unwrap();
    let (reader, writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();

    poller
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    // Replacing the interest set with itself must be a no-op.
    poller.change_events(&reader, Interest::READABLE).unwrap();

    // Removing read interest silences the attachment even with data queued.
    poller.remove_events(&reader, Interest::READABLE).unwrap();
    writer.write(b"x").unwrap();
    poller.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(recorder.reads(), 0);

    // Adding it back restores the original behavior.
    poller.add_events(&reader, Interest::READABLE).unwrap();
    poll_until(&poller, || recorder.reads() > 0, "read after re-adding");
}

#[test]
fn edge_emulation_on_poll_backend() {
    init();

    let poller = Poller::with_backend(Backend::Poll).unwrap();
    assert!(poller.supports_edge_triggering());

    let (reader, writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Edge)
        .unwrap();

    writer.write(b"ab").unwrap();
    poll_until(&poller, || recorder.reads() > 0, "first edge delivery");
    assert_eq!(recorder.reads(), 1);

    // Not draining the pipe must not re-deliver readiness.
    poller.poll(Some(Duration::from_millis(50))).unwrap();
    poller.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(recorder.reads(), 1);

    // A partial read leaves data queued and still no re-delivery.
    let mut one = [0; 1];
    assert_eq!(reader.read(&mut one).unwrap().bytes, 1);
    poller.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(recorder.reads(), 1);

    // Draining to would-block re-arms the interest.
    assert_eq!(reader.read(&mut one).unwrap().bytes, 1);
    let blocked = reader.read(&mut one).unwrap();
    assert!(!blocked.completed);

    writer.write(b"c").unwrap();
    poll_until(&poller, || recorder.reads() > 1, "edge delivery after rearm");
    assert_eq!(recorder.reads(), 2);
}

struct DetachOnRead {
    poller: Poller,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl StatusListener for DetachOnRead {
    fn on_read_ready(&self, transport: &Arc<Transport>) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.poller.detach(transport);
    }

    fn on_write_ready(&self, _transport: &Arc<Transport>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn detach_in_callback_suppresses_batch() {
    init();

    let poller = Poller::new().unwrap();
    let (local, peer) = socket_pair();

    // Make the socket readable and writable in the same batch.
    peer.write(b"data").unwrap();

    let listener = Arc::new(DetachOnRead {
        poller: poller.clone(),
        reads: AtomicUsize::new(0),
        writes: AtomicUsize::new(0),
    });
    poller
        .attach(
            &local,
            listener.clone(),
            Interest::READABLE | Interest::WRITABLE,
            EventMode::Level,
        )
        .unwrap();

    poll_until(&poller, || listener.reads.load(Ordering::SeqCst) > 0, "read");

    // The detach inside the read callback suppressed the write event that
    // was pending in the same batch.
    assert_eq!(listener.writes.load(Ordering::SeqCst), 0);
    assert!(!local.is_attached());

    // A transport attached afterwards reuses the freed slot and still
    // receives its own events.
    let (reader, writer) = Transport::pipe().unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&reader, recorder.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();
    writer.write(b"again").unwrap();
    poll_until(&poller, || recorder.reads() > 0, "reused slot delivery");
}

#[test]
fn closed_transport_cannot_attach() {
    init();

    let poller = Poller::new().unwrap();
    let (reader, _writer) = Transport::pipe().unwrap();
    reader.close();

    match poller.attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level) {
        Err(Error::Library(LibraryError::TransportClosed)) => {}
        other => panic!("expected TransportClosed, got {:?}", other),
    }
}

#[test]
fn shutdown_detaches_everything() {
    init();

    let poller = Poller::new().unwrap();
    let (reader, writer) = Transport::pipe().unwrap();
    poller
        .attach(&reader, Recorder::new(), Interest::READABLE, EventMode::Level)
        .unwrap();
    poller
        .attach(&writer, Recorder::new(), Interest::WRITABLE, EventMode::Level)
        .unwrap();

    poller.shutdown();
    assert!(!reader.is_attached());
    assert!(!writer.is_attached());
}
