use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use evio::TaskQueue;

mod util;

use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<TaskQueue>();
    assert_sync::<TaskQueue>();
}

#[test]
fn same_thread_posts_run_in_order() {
    init();

    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let log = log.clone();
        queue.post(move || log.lock().unwrap().push(i));
    }

    assert!(queue.process_tasks(None, 0));
    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn cross_thread_posts_all_arrive() {
    init();

    let queue = Arc::new(TaskQueue::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let ran = ran.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                let ran = ran.clone();
                queue.post(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                });
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    while queue.process_next_task() {}
    assert_eq!(ran.load(Ordering::SeqCst), 100);
}

#[test]
fn quit_stops_processing() {
    init();

    let queue = Arc::new(TaskQueue::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let quitter = queue.clone();
    let first = ran.clone();
    queue.post(move || {
        first.fetch_add(1, Ordering::SeqCst);
        quitter.post_quit();
    });
    let second = ran.clone();
    queue.post(move || {
        second.fetch_add(1, Ordering::SeqCst);
    });

    assert!(queue.process_tasks(None, 0));
    assert!(queue.should_quit());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn break_stops_the_current_run() {
    init();

    let queue = Arc::new(TaskQueue::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let breaker = queue.clone();
    let first = ran.clone();
    queue.post(move || {
        first.fetch_add(1, Ordering::SeqCst);
        breaker.break_loop();
    });
    let second = ran.clone();
    queue.post(move || {
        second.fetch_add(1, Ordering::SeqCst);
    });

    assert!(queue.process_tasks(None, 0));
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    // The break is consumed; the next run picks up the remainder.
    assert!(queue.process_tasks(None, 0));
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn time_budget_drains_small_queues() {
    init();

    let queue = TaskQueue::new();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let ran = ran.clone();
        queue.post(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(queue.process_tasks(Some(Duration::from_secs(5)), 0));
    assert_eq!(ran.load(Ordering::SeqCst), 50);
}

#[test]
fn quit_is_idempotent() {
    init();

    let queue = TaskQueue::new();
    queue.post_quit();
    queue.post_quit();
    assert!(queue.should_quit());
}
