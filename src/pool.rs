use super::{
    errors::DispatchError,
    mailbox::Mailbox,
    model::PoolMetrics,
    signal::Signal,
    task::Task,
    worker::{on_pool_thread, PoolThread},
};
use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;


/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Pool threads started up front. The pool grows on demand beyond this.
    pub initial_threads: usize,
    pub thread_name: String,
    pub stack_size: Option<usize>,
    /// Upper bound on a single timer-thread sleep.
    pub timer_max_wait: Duration,
    pub stop_poll_interval: Duration,
    pub stop_report_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_threads: 0,
            thread_name: "dispatch".to_string(),
            stack_size: None,
            timer_max_wait: Duration::from_secs(60),
            stop_poll_interval: Duration::from_millis(10),
            stop_report_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        Self {
            initial_threads: num_cpus::get(),
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        Self {
            initial_threads: num_cpus::get() * 2, // handlers mostly block
            ..Default::default()
        }
    }
}


/// State shared between the master and its pool threads.
pub(crate) struct PoolShared {
    idle: SegQueue<Arc<PoolThread>>,
    allocated: AtomicUsize,
    spawned: AtomicUsize,
    spawn_failures: AtomicUsize,
    assignments: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            idle: SegQueue::new(),
            allocated: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            spawn_failures: AtomicUsize::new(0),
            assignments: AtomicUsize::new(0),
        }
    }

    /// Called by a pool thread once its drain is over.
    pub(crate) fn release(&self, thread: Arc<PoolThread>) {
        self.idle.push(thread);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A pool thread leaving on its own after the pool closed.
    pub(crate) fn retire(&self) {
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }
}


/// Hands ready tasks to pool threads.
///
/// The master owns one thread that drains the ready list with the same
/// mailbox discipline a task uses for its items. Pool threads are created
/// lazily and only go away in [`Master::stop`].
pub struct Master {
    config: Config,
    ready: Mailbox<Arc<Task>>,
    signal: Signal,
    operational: AtomicBool,
    shared: Arc<PoolShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Master {
    pub fn start(config: Config) -> Result<Arc<Self>, DispatchError> {
        let master = Arc::new(Self {
            config,
            ready: Mailbox::new(),
            signal: Signal::new(),
            operational: AtomicBool::new(true),
            shared: Arc::new(PoolShared::new()),
            handle: Mutex::new(None),
        });

        for _ in 0..master.config.initial_threads {
            match master.spawn_thread() {
                Ok(thread) => master.shared.release(thread),
                Err(e) => {
                    master.stop();
                    return Err(e);
                }
            }
        }

        let name = format!("{}-master", master.config.thread_name);
        let runner = master.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || runner.run());
        match spawned {
            Ok(handle) => *master.handle.lock() = Some(handle),
            Err(source) => {
                master.stop();
                return Err(DispatchError::Spawn { name, source });
            }
        }

        debug!("master started with {} pool thread(s)", master.config.initial_threads);
        Ok(master)
    }

    /// Queues a ready task for assignment.
    #[inline]
    pub fn enqueue(&self, task: Arc<Task>) {
        if self.ready.push(task) {
            self.signal.post();
        }
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            allocated_threads: self.allocated(),
            idle_threads: self.shared.idle.len(),
            spawned_threads: self.shared.spawned.load(Ordering::Relaxed),
            spawn_failures: self.shared.spawn_failures.load(Ordering::Relaxed),
            ready_tasks: self.ready.len(),
            assignments: self.shared.assignments.load(Ordering::Relaxed),
        }
    }

    /// Stops and joins every pool thread, then the master thread.
    ///
    /// Busy threads are waited for: they come back to the idle list when their
    /// drain finishes and are stopped on a later pass. Tasks still on the ready
    /// list are assigned before the loop can finish.
    pub fn stop(&self) {
        debug!("master stop...");
        // Stopping from one of our own threads: that one can only leave once
        // its current drain returns.
        let own = usize::from(on_pool_thread(&self.shared));
        let mut since_report = Instant::now();
        loop {
            while let Some(thread) = self.shared.idle.pop() {
                thread.stop();
                thread.join();
                self.shared.allocated.fetch_sub(1, Ordering::AcqRel);
            }

            if self.ready.is_idle() && self.allocated() <= own {
                break;
            }

            if since_report.elapsed() >= self.config.stop_report_interval {
                info!(
                    "master stop: waiting for {} open thread(s), {} ready task(s)",
                    self.allocated(),
                    self.ready.len()
                );
                since_report = Instant::now();
            }
            thread::sleep(self.config.stop_poll_interval);
        }

        self.shared.closed.store(true, Ordering::Release);
        self.operational.store(false, Ordering::Release);
        self.signal.post();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("master thread panicked");
            }
        }
        debug!("...master stop");
    }

    fn run(&self) {
        loop {
            self.signal.wait();

            if !self.ready.is_idle() {
                self.ready.drain(
                    |task| {
                        self.assign(task);
                        ControlFlow::Continue(())
                    },
                    |_| {},
                );
            }

            if !self.operational.load(Ordering::Acquire) {
                break;
            }
        }
    }

    fn assign(&self, task: Arc<Task>) {
        let thread = match self.shared.idle.pop() {
            Some(thread) => thread,
            None => match self.spawn_thread() {
                Ok(thread) => thread,
                Err(e) => {
                    self.shared.spawn_failures.fetch_add(1, Ordering::Relaxed);
                    error!("{e}; draining task '{}' on the master thread", task.name());
                    task.drain();
                    return;
                }
            },
        };

        self.shared.assignments.fetch_add(1, Ordering::Relaxed);
        thread.assign(task);
    }

    fn spawn_thread(&self) -> Result<Arc<PoolThread>, DispatchError> {
        let id = self.shared.spawned.fetch_add(1, Ordering::Relaxed);
        self.shared.allocated.fetch_add(1, Ordering::AcqRel);
        match PoolThread::spawn(id, &self.config, self.shared.clone()) {
            Ok(thread) => Ok(thread),
            Err(e) => {
                self.shared.allocated.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    pub(crate) fn debug(&self) {
        let m = self.metrics();
        debug!(
            "master: allocated({}) idle({}) spawned({}) ready({}) assignments({})",
            m.allocated_threads, m.idle_threads, m.spawned_threads, m.ready_tasks, m.assignments
        );
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("metrics", &self.metrics())
            .finish()
    }
}
