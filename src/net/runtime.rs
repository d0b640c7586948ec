//! The network runtime: one high-priority thread that polls every registered
//! slot table at a fixed cadence.
//!
//! One iteration reads incoming packets for each receiver and drains each
//! sender's outgoing queue. The cadence should stay well below the packet
//! time (tenths of it) so per-socket single reads keep up with the stream.
//! The task list is published through the RCU cell, so registering and
//! removing tasks never blocks the polling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::sync::{Rcu, Reader};

/// Default polling interval: a tenth of the 1 ms AES67 packet time.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_micros(100);

/// Work the network thread performs every tick. Implemented by the receiver
/// and sender slot tables.
pub trait NetworkTask: Send + Sync {
    fn process(&self);
}

type TaskList = Vec<Arc<dyn NetworkTask>>;

/// Owns the network thread. Create one per process, register the slot
/// tables, and keep it alive for as long as streaming should run.
pub struct NetworkRuntime {
    tasks: Arc<Rcu<TaskList>>,
    tasks_mutex: Mutex<()>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkRuntime {
    pub fn new() -> Self {
        Self::with_tick_interval(DEFAULT_TICK_INTERVAL)
    }

    pub fn with_tick_interval(tick_interval: Duration) -> Self {
        let tasks: Arc<Rcu<TaskList>> = Arc::new(Rcu::with_value(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let tasks = Arc::clone(&tasks);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("rtp-network".into())
                .spawn(move || run_network_loop(&tasks, &running, tick_interval))
                .expect("failed to spawn the network thread")
        };

        Self {
            tasks,
            tasks_mutex: Mutex::new(()),
            running,
            thread: Some(thread),
        }
    }

    /// Registers a task. It will be processed starting with one of the next
    /// ticks.
    pub fn add_task(&self, task: Arc<dyn NetworkTask>) {
        let _guard = self.tasks_mutex.lock();
        let mut list = self.current_tasks();
        list.push(task);
        self.tasks.update(list);
        self.tasks.reclaim();
    }

    /// Removes a previously registered task. Returns true if it was found.
    pub fn remove_task(&self, task: &Arc<dyn NetworkTask>) -> bool {
        let _guard = self.tasks_mutex.lock();
        let mut list = self.current_tasks();
        let before = list.len();
        list.retain(|other| !Arc::ptr_eq(other, task));
        let removed = list.len() != before;
        self.tasks.update(list);
        self.tasks.reclaim();
        removed
    }

    fn current_tasks(&self) -> TaskList {
        // Writer side; a short-lived reader is fine here.
        let reader = Reader::new(&self.tasks);
        let lock = reader.lock();
        lock.get().cloned().unwrap_or_default()
    }

    /// Stops and joins the network thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Default for NetworkRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_network_loop(tasks: &Arc<Rcu<TaskList>>, running: &AtomicBool, tick_interval: Duration) {
    raise_thread_priority();

    let reader = Reader::new(tasks);
    while running.load(Ordering::SeqCst) {
        {
            let lock = reader.lock();
            if let Some(list) = lock.get() {
                for task in list {
                    task.process();
                }
            }
        }
        std::thread::sleep(tick_interval);
    }
}

/// Raises the calling thread's priority for low receive latency.
fn raise_thread_priority() {
    #[cfg(unix)]
    unsafe {
        if libc::nice(-20) == -1 {
            log::trace!("network thread: could not raise priority");
        }
    }

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
        };
        SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
    }
}
