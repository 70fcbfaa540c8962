use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use evio::{EventLoop, EventMode, Interest, StatusListener, Transport};

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<EventLoop>();
    assert_sync::<EventLoop>();
}

#[test]
fn posted_tasks_run_before_quit() {
    init();

    let event_loop = EventLoop::new(None).unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let quitter = event_loop.clone();
    event_loop.post(move || {
        flag.store(true, Ordering::SeqCst);
        quitter.post_quit();
    });

    event_loop.run();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_posts_wake_both_loops() {
    init();

    let loop1 = EventLoop::new(None).unwrap();
    let loop2 = EventLoop::new(None).unwrap();

    let thread1 = thread::spawn({
        let loop1 = loop1.clone();
        move || loop1.run()
    });
    let thread2 = thread::spawn({
        let loop2 = loop2.clone();
        move || loop2.run()
    });

    // A task posted to loop 2 quits both loops; both threads must come
    // home without further nudging.
    let quit1 = loop1.clone();
    let quit2 = loop2.clone();
    loop2.post(move || {
        quit1.post_quit();
        quit2.post_quit();
    });

    thread1.join().unwrap();
    thread2.join().unwrap();
    assert!(loop1.should_quit());
    assert!(loop2.should_quit());
}

struct ReadAndQuit {
    event_loop: EventLoop,
    data: Mutex<Vec<u8>>,
}

impl StatusListener for ReadAndQuit {
    fn on_read_ready(&self, transport: &Arc<Transport>) {
        let mut buf = [0; 32];
        let result = transport.read(&mut buf).unwrap();
        self.data
            .lock()
            .unwrap()
            .extend_from_slice(&buf[..result.bytes]);
        self.event_loop.post_quit();
    }
}

#[test]
fn io_events_flow_through_the_loop() {
    init();

    let event_loop = EventLoop::new(None).unwrap();
    let (reader, writer) = Transport::pipe().unwrap();

    let listener = Arc::new(ReadAndQuit {
        event_loop: event_loop.clone(),
        data: Mutex::new(Vec::new()),
    });
    event_loop
        .attach(&reader, listener.clone(), Interest::READABLE, EventMode::Level)
        .unwrap();

    writer.write(b"ping").unwrap();
    event_loop.run();

    assert_eq!(&*listener.data.lock().unwrap(), b"ping");
    event_loop.shutdown();
}

#[test]
fn tasks_posted_while_blocked_interrupt_the_wait() {
    init();

    let event_loop = EventLoop::new(None).unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    let runner = thread::spawn({
        let event_loop = event_loop.clone();
        move || event_loop.run()
    });

    // Give the loop time to block in the kernel, then poke it.
    thread::sleep(std::time::Duration::from_millis(100));
    let flag = ran.clone();
    let quitter = event_loop.clone();
    event_loop.post(move || {
        flag.store(true, Ordering::SeqCst);
        quitter.post_quit();
    });

    runner.join().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}
