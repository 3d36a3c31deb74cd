//! Periodic task scheduling.
//!
//! One scheduling thread runs all of a cache's timer work (scavenger tick,
//! throughput check). Tasks are closures with fixed intervals; due times
//! come from the injected [`Clock`], so tests can also invoke the task
//! bodies directly without any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;

type Task = Box<dyn FnMut() + Send>;

struct Inner {
    tasks: Mutex<Vec<(Duration, u64, Task)>>,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
    clock: Arc<dyn Clock>,
}

/// A single background thread executing registered periodic tasks.
pub struct Scheduler {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                sleep_cond: Condvar::new(),
                clock,
            }),
            handle: None,
        }
    }

    /// Register a task to run every `interval`, first firing one interval
    /// from now.
    pub fn schedule(&self, interval: Duration, task: impl FnMut() + Send + 'static) {
        let due = self.inner.clock.now_millis() + interval.as_millis() as u64;
        self.inner
            .tasks
            .lock()
            .push((interval, due, Box::new(task)));
    }

    /// Start the scheduling thread.
    pub fn start(&mut self, name: &str) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || run(inner))
            .expect("failed to spawn scheduler thread");
        self.handle = Some(handle);
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.sleep_lock.lock();
            self.inner.sleep_cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<Inner>) {
    // Short poll quantum: the injected clock may jump arbitrarily between
    // polls, so due times are re-evaluated rather than slept toward.
    const QUANTUM: Duration = Duration::from_millis(50);
    while !inner.shutdown.load(Ordering::Acquire) {
        let now = inner.clock.now_millis();
        {
            let mut tasks = inner.tasks.lock();
            for (interval, due, task) in tasks.iter_mut() {
                if now >= *due {
                    task();
                    *due = now + interval.as_millis() as u64;
                }
            }
        }
        let mut guard = inner.sleep_lock.lock();
        if !inner.shutdown.load(Ordering::Acquire) {
            inner.sleep_cond.wait_for(&mut guard, QUANTUM);
        }
    }
}
