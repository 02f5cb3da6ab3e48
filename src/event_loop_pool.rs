//! Worker event loops, one per thread, handed out round-robin.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::error::{TzzeroError, TzzeroResult};
use crate::event_loop::EventLoop;

/// A thread running its own event loop. The loop is constructed on the
/// new thread (the loop's driving thread) and published back through a
/// channel before `run()` starts.
pub struct EventLoopThread {
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(
        name: String,
        pin_core: Option<core_affinity::CoreId>,
    ) -> TzzeroResult<EventLoopThread> {
        let (tx, rx) = mpsc::channel();
        let thread_name = name.clone();

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(core) = pin_core {
                    if core_affinity::set_for_current(core) {
                        debug!("{} pinned to CPU {}", thread_name, core.id);
                    } else {
                        debug!("{} failed to pin to CPU {}", thread_name, core.id);
                    }
                }

                let event_loop = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        error!("{}: failed to create event loop: {}", thread_name, e);
                        return;
                    }
                };

                if tx.send(Arc::clone(&event_loop)).is_err() {
                    return;
                }
                event_loop.run();
            })
            .map_err(TzzeroError::Io)?;

        let event_loop = rx.recv().map_err(|_| {
            TzzeroError::WorkerStartup("worker died before publishing its loop".to_string())
        })?;

        Ok(EventLoopThread {
            event_loop: Some(event_loop),
            thread: Some(thread),
        })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        self.event_loop.as_ref().expect("loop published at start")
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    started: AtomicBool,
    num_threads: AtomicUsize,
    pin_cpus: AtomicBool,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            pin_cpus: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Must be called before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.num_threads.store(num_threads, Ordering::Release);
    }

    /// Pin worker threads round-robin across cores.
    pub fn pin_cpus(&self, on: bool) {
        self.pin_cpus.store(on, Ordering::Release);
    }

    pub fn start(&self) -> TzzeroResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let num_threads = self.num_threads.load(Ordering::Acquire);
        let core_ids = if self.pin_cpus.load(Ordering::Acquire) {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let core = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let worker = EventLoopThread::start(format!("tzzero-worker-{}", i), core)?;
            loops.push(Arc::clone(worker.event_loop()));
            threads.push(worker);
        }

        Ok(())
    }

    /// Round-robin selection; the base loop when no workers exist.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            Arc::clone(&self.base_loop)
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            Arc::clone(&loops[index])
        }
    }
}
