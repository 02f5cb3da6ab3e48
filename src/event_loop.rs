//! Single-threaded reactor: one poller, one timer queue, an eventfd
//! wakeup channel and a queue of deferred tasks.
//!
//! Exactly one thread (the one that constructed the loop) may drive
//! `run()`, and at most one loop may exist per thread. `run_in_loop`,
//! `queue_in_loop`, timers and `quit` are safe to call from any thread;
//! cross-thread work is handed over through the pending queue and an
//! eventfd write.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::error;

use crate::error::{TzzeroError, TzzeroResult};
use crate::poller::{create_poller, PollEvent, Poller, EVENT_READ};
use crate::sys;
use crate::timer::{TimerId, TimerQueue};

pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

pub struct EventLoop {
    poller: Mutex<Box<dyn Poller + Send>>,
    timer_queue: Mutex<TimerQueue>,
    wakeup_fd: RawFd,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    pub fn new() -> TzzeroResult<Arc<EventLoop>> {
        let already = LOOP_IN_THIS_THREAD.with(|cell| cell.replace(true));
        if already {
            return Err(TzzeroError::LoopExists);
        }

        let parts = (|| {
            let poller = create_poller()?;
            let timer_queue = TimerQueue::new()?;
            let wakeup_fd = sys::create_eventfd()?;
            Ok::<_, TzzeroError>((poller, timer_queue, wakeup_fd))
        })();
        let (poller, timer_queue, wakeup_fd) = match parts {
            Ok(parts) => parts,
            Err(e) => {
                LOOP_IN_THIS_THREAD.with(|cell| cell.set(false));
                return Err(e);
            }
        };
        let timer_fd = timer_queue.timer_fd();

        let event_loop = Arc::new(EventLoop {
            poller: Mutex::new(poller),
            timer_queue: Mutex::new(timer_queue),
            wakeup_fd,
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&event_loop);
        event_loop.poller.lock().unwrap().add_fd(
            wakeup_fd,
            EVENT_READ,
            Arc::new(move |_| {
                if let Some(lp) = weak.upgrade() {
                    lp.handle_wakeup();
                }
            }),
        )?;

        let weak = Arc::downgrade(&event_loop);
        event_loop.poller.lock().unwrap().add_fd(
            timer_fd,
            EVENT_READ,
            Arc::new(move |_| {
                if let Some(lp) = weak.upgrade() {
                    lp.handle_timer_fd();
                }
            }),
        )?;

        Ok(event_loop)
    }

    /// Drive the loop until `quit()`. Panics if called from a thread
    /// other than the one that constructed it, or re-entered.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called off the loop thread"
        );
        assert!(
            !self.looping.swap(true, Ordering::AcqRel),
            "EventLoop::run re-entered"
        );
        self.quit.store(false, Ordering::Release);

        let mut active_events: Vec<PollEvent> = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            active_events.clear();

            let timeout_ms = self.timer_queue.lock().unwrap().next_timeout_ms();

            let polled = self
                .poller
                .lock()
                .unwrap()
                .poll(timeout_ms, &mut active_events);
            if let Err(e) = polled {
                error!("poller error: {}", e);
                break;
            }

            self.process_expired_timers();

            // I/O callbacks run in the order the notifier reported them,
            // with no poller lock held so they can re-register freely.
            for event in &active_events {
                (event.callback)(event.events);
            }

            self.do_pending_tasks();
        }

        self.looping.store(false, Ordering::Release);
    }

    /// Stop the loop. From another thread this also wakes the poll; from
    /// the loop thread the running iteration observes the flag next time
    /// around.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Run `task` synchronously when called on the loop thread, otherwise
    /// enqueue it and wake the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueue, always wake.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_tasks.lock().unwrap().push(Box::new(task));
        self.wakeup();
    }

    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer_queue
            .lock()
            .unwrap()
            .add_timer(delay, None, Arc::new(callback))
    }

    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer_queue
            .lock()
            .unwrap()
            .add_timer(interval, Some(interval), Arc::new(callback))
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.timer_queue.lock().unwrap().cancel(id);
    }

    /// Access the readiness notifier for fd registration. Registration
    /// changes must happen on the loop thread.
    pub fn poller(&self) -> MutexGuard<'_, Box<dyn Poller + Send>> {
        self.poller.lock().unwrap()
    }

    fn wakeup(&self) {
        sys::write_eventfd(self.wakeup_fd);
    }

    fn handle_wakeup(&self) {
        sys::read_eventfd(self.wakeup_fd);
    }

    fn handle_timer_fd(&self) {
        self.timer_queue.lock().unwrap().handle_read();
        self.process_expired_timers();
    }

    fn process_expired_timers(&self) {
        let now = Instant::now();
        let expired = self.timer_queue.lock().unwrap().take_expired(now);
        if expired.is_empty() {
            return;
        }

        // Callbacks run without the queue lock so they can add or cancel
        // timers, including cancelling themselves.
        for timer in &expired {
            timer.run();
        }

        self.timer_queue.lock().unwrap().restart_expired(expired, now);
    }

    fn do_pending_tasks(&self) {
        let tasks = {
            let mut pending = self.pending_tasks.lock().unwrap();
            std::mem::take(&mut *pending)
        };

        for task in tasks {
            task();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        sys::close_fd(self.wakeup_fd);
        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|cell| cell.set(false));
        }
    }
}
