use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use crate::time;

/// A unit of deferred work posted to a [`TaskQueue`].
///
/// Implemented for any `FnMut() + Send` closure, so most callers never name
/// this trait.
pub trait Task: Send {
    /// Invoked when the task runs.
    fn run(&mut self);

    /// Asks the task to cancel. Tasks may ignore cancel requests.
    fn cancel(&mut self) {}
}

impl<F: FnMut() + Send> Task for F {
    fn run(&mut self) {
        (self)()
    }
}

/// Receives queue notifications, usually implemented by an event loop so it
/// can interrupt a blocking poll when work arrives.
pub trait QueueDelegate: Send + Sync {
    /// A task has been posted.
    fn notify_task(&self);

    /// A quit request has been posted.
    fn notify_quit(&self);
}

struct Queues {
    incoming: VecDeque<Box<dyn Task>>,
    working: VecDeque<Box<dyn Task>>,
}

/// A queue of tasks processed from an event loop. Any thread may post.
///
/// Internally two deques are kept: posts land in *incoming* under the queue
/// lock, and the processing functions drain *working*, swapping the deques
/// when it runs dry. Tasks posted while a task runs therefore execute on the
/// next processing cycle, not the current one.
pub struct TaskQueue {
    queues: Mutex<Queues>,
    delegate: Option<Weak<dyn QueueDelegate>>,
    got_quit: AtomicBool,
    got_break: AtomicBool,
    timer_res: u64,
}

impl TaskQueue {
    /// Creates a queue with no delegate. Such a queue never interrupts a
    /// poller; it is suitable as a loop-private buffer.
    pub fn new() -> TaskQueue {
        TaskQueue::build(None)
    }

    /// Creates a queue whose delegate is notified on every post.
    pub fn with_delegate(delegate: Weak<dyn QueueDelegate>) -> TaskQueue {
        TaskQueue::build(Some(delegate))
    }

    fn build(delegate: Option<Weak<dyn QueueDelegate>>) -> TaskQueue {
        TaskQueue {
            queues: Mutex::new(Queues {
                incoming: VecDeque::new(),
                working: VecDeque::new(),
            }),
            delegate,
            got_quit: AtomicBool::new(false),
            got_break: AtomicBool::new(false),
            timer_res: time::resolution(),
        }
    }

    /// Posts a task. Thread-safe.
    pub fn post_task(&self, task: Box<dyn Task>) {
        {
            let mut queues = self.queues.lock().unwrap();
            queues.incoming.push_back(task);
        }

        if let Some(delegate) = self.delegate() {
            delegate.notify_task();
        }
    }

    /// Posts a closure as a task. Thread-safe.
    pub fn post<F: FnMut() + Send + 'static>(&self, f: F) {
        self.post_task(Box::new(f));
    }

    /// Sets the quit flag and notifies the delegate. Processing stops at the
    /// next opportunity; already-posted tasks stay queued.
    pub fn post_quit(&self) {
        self.got_quit.store(true, Ordering::Release);
        if let Some(delegate) = self.delegate() {
            delegate.notify_quit();
        }
    }

    /// Returns true if [`post_quit`] was called.
    ///
    /// [`post_quit`]: TaskQueue::post_quit
    pub fn should_quit(&self) -> bool {
        self.got_quit.load(Ordering::Acquire)
    }

    /// If a `process_tasks` run is in progress, stop it as soon as possible.
    pub fn break_loop(&self) {
        self.got_break.store(true, Ordering::Release);
    }

    /// Runs at most one task. Returns whether a task ran.
    pub fn process_next_task(&self) -> bool {
        let task = {
            let mut queues = self.queues.lock().unwrap();
            if queues.working.is_empty() {
                if queues.incoming.is_empty() {
                    return false;
                }
                let Queues { incoming, working } = &mut *queues;
                mem::swap(incoming, working);
            }
            queues.working.pop_front()
        };

        match task {
            Some(mut task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue drains, the quit or break flag is set,
    /// `nlimit` tasks have run (when `nlimit > 0`), or the elapsed time
    /// reaches `timelimit`.
    ///
    /// When a `timelimit` is given but the clock resolution probe reported
    /// zero, exactly one task is processed. Returns whether any task ran.
    pub fn process_tasks(&self, timelimit: Option<Duration>, nlimit: usize) -> bool {
        match timelimit {
            Some(timelimit) => self.process_tasks_for_time(timelimit, nlimit),
            None => self.process_tasks_bounded(nlimit),
        }
    }

    fn process_tasks_bounded(&self, nlimit: usize) -> bool {
        // Cleared before any task runs, so a break posted by the first
        // task still stops the run.
        self.got_break.store(false, Ordering::Release);

        if !self.process_next_task() {
            return false;
        }

        let mut count = 0;
        loop {
            count += 1;
            if nlimit > 0 && count >= nlimit {
                break;
            }
            if self.should_quit() || self.got_break.load(Ordering::Acquire) {
                break;
            }
            if !self.process_next_task() {
                break;
            }
        }

        true
    }

    fn process_tasks_for_time(&self, timelimit: Duration, nlimit: usize) -> bool {
        if self.timer_res == 0 {
            // Too risky to use timers; take one step and leave.
            return self.process_next_task();
        }

        self.got_break.store(false, Ordering::Release);

        let mut maxtime = timelimit.as_nanos().min(u128::from(u64::MAX)) as u64;
        // Don't risk taking more time than we have resolution for.
        maxtime -= maxtime % self.timer_res;

        let start = time::counter();
        let end = start.saturating_add(maxtime);
        let mut last = start;

        let mut ran = false;
        let mut count = 0;
        while self.process_next_task() {
            ran = true;

            let now = time::counter();
            if now >= end || self.should_quit() || self.got_break.load(Ordering::Acquire) {
                break;
            }

            count += 1;
            if nlimit > 0 && count >= nlimit {
                break;
            }

            // Guard against clock regressions looping forever.
            if now < last {
                break;
            }
            last = now;
        }

        ran
    }

    fn delegate(&self) -> Option<std::sync::Arc<dyn QueueDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }
}

impl Default for TaskQueue {
    fn default() -> TaskQueue {
        TaskQueue::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let mut queues = self.queues.lock().unwrap();
        for mut task in queues.incoming.drain(..) {
            task.cancel();
        }
        for mut task in queues.working.drain(..) {
            task.cancel();
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("got_quit", &self.should_quit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::TaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_post_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            queue.post(move || log.lock().unwrap().push(i));
        }

        while queue.process_next_task() {}
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn posts_during_run_execute_after_existing_tasks() {
        let queue = Arc::new(TaskQueue::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue.post(move || {
            inner_log.lock().unwrap().push(1);
            let log = inner_log.clone();
            inner_queue.post(move || log.lock().unwrap().push(3));
        });
        let outer_log = log.clone();
        queue.post(move || outer_log.lock().unwrap().push(2));

        // The task posted while 1 ran lands in the incoming deque and only
        // runs once the working deque has drained.
        assert!(queue.process_tasks(None, 0));
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn nlimit_bounds_a_cycle() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            queue.post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(queue.process_tasks(None, 2));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quit_flag_is_sticky() {
        let queue = TaskQueue::new();
        assert!(!queue.should_quit());
        queue.post_quit();
        queue.post_quit();
        assert!(queue.should_quit());
    }
}
