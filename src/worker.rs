use super::{
    errors::DispatchError,
    pool::{Config, PoolShared},
    signal::Signal,
    task::Task,
};
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;


thread_local! {
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread is one of `pool`'s threads.
pub(crate) fn on_pool_thread(pool: &Arc<PoolShared>) -> bool {
    CURRENT_POOL.with(|c| c.get() == Arc::as_ptr(pool) as usize)
}

/// A reusable execution context that drains one [`Task`] at a time.
///
/// The thread parks on its wake signal between assignments and returns itself
/// to the pool's idle list after every drain. Stopping is cooperative: a drain
/// in progress always runs to completion.
pub struct PoolThread {
    id: usize,
    name: String,
    signal: Signal,
    operational: AtomicBool,
    task: Mutex<Option<Arc<Task>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PoolThread {
    pub(crate) fn spawn(
        id: usize,
        config: &Config,
        pool: Arc<PoolShared>,
    ) -> Result<Arc<Self>, DispatchError> {
        let name = format!("{}-{}", config.thread_name, id);
        let worker = Arc::new(Self {
            id,
            name: name.clone(),
            signal: Signal::new(),
            operational: AtomicBool::new(true),
            task: Mutex::new(None),
            handle: Mutex::new(None),
        });

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let runner = worker.clone();
        let handle = builder
            .spawn(move || runner.run(pool))
            .map_err(|source| DispatchError::Spawn { name, source })?;

        *worker.handle.lock() = Some(handle);
        Ok(worker)
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_busy(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Hands `task` to this (idle) thread and wakes it.
    pub(crate) fn assign(&self, task: Arc<Task>) {
        trace!("{}: assigned task '{}'", self.name, task.name());
        *self.task.lock() = Some(task);
        self.signal.post();
    }

    pub(crate) fn stop(&self) {
        debug!("{}: stop", self.name);
        self.operational.store(false, Ordering::Release);
        self.signal.post();
    }

    /// Joins the OS thread. A thread asked to join itself is detached instead.
    pub(crate) fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            debug!("{}: detached (stopped from its own thread)", self.name);
            return;
        }

        if handle.join().is_err() {
            warn!("{}: thread panicked", self.name);
        }
    }

    fn run(self: Arc<Self>, pool: Arc<PoolShared>) {
        CURRENT_POOL.with(|c| c.set(Arc::as_ptr(&pool) as usize));
        debug!("{}: started", self.name);
        loop {
            self.signal.wait();

            let assigned = self.task.lock().clone();
            if let Some(task) = assigned {
                task.drain();
                *self.task.lock() = None;

                // The pool was shut down from inside this drain.
                if pool.is_closed() {
                    pool.retire();
                    break;
                }
                pool.release(self.clone());
            }

            if !self.operational.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("{}: terminated", self.name);
    }
}

impl std::fmt::Debug for PoolThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolThread")
            .field("name", &self.name)
            .field("busy", &self.is_busy())
            .field("operational", &self.operational.load(Ordering::Relaxed))
            .finish()
    }
}
