use super::{
    errors::{DispatchError, EnqueueError},
    handle::{completion, CompletionHandle, Wait},
    item::{Done, WorkItem},
    model::DispatchMetrics,
    pool::{Config, Master},
    task::Task,
    timer::{TimerService, TimerToken},
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use log::debug;
use parking_lot::{Mutex, RwLock};


pub type Dispatcher = Arc<DispatcherInner>;

/// Owns one [`Master`] and one [`TimerService`] for its whole life.
///
/// Both are torn down exactly once, by the first call to
/// [`DispatcherInner::wait`] (or by drop).
pub struct DispatcherInner {
    config: Config,
    master: RwLock<Option<Arc<Master>>>,
    timers: Mutex<Option<Arc<TimerService>>>,
    enqueued: AtomicUsize,
    rejected: AtomicUsize,
    inline_drains: AtomicUsize,
}

impl DispatcherInner {
    pub fn new() -> Result<Dispatcher, DispatchError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Dispatcher, DispatchError> {
        let master = Master::start(config.clone())?;
        let timers = match TimerService::start(&config) {
            Ok(timers) => timers,
            Err(e) => {
                master.stop();
                return Err(e);
            }
        };

        debug!("dispatcher '{}' started", config.thread_name);
        Ok(Arc::new(Self {
            config,
            master: RwLock::new(Some(master)),
            timers: Mutex::new(Some(timers)),
            enqueued: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            inline_drains: AtomicUsize::new(0),
        }))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.master.read().is_some()
    }

    /// Appends `item` to `task`, scheduling the task if it was idle.
    ///
    /// The first enqueue binds the task to this dispatcher; a task bound to
    /// another live dispatcher is refused and the item handed back.
    pub fn enqueue(self: &Arc<Self>, task: &Arc<Task>, item: WorkItem) -> Result<(), EnqueueError> {
        if let Err(reason) = task.bind(self) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::new(item, reason));
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        // Held across the push so `wait()` can't retire the master between
        // the task becoming ready and the hand-off.
        let master = self.master.read();
        if !task.push(item) {
            return Ok(());
        }

        match master.as_ref() {
            Some(master) => master.enqueue(task.clone()),
            None => {
                drop(master);
                debug!("no master, draining task '{}' inline", task.name());
                self.inline_drains.fetch_add(1, Ordering::Relaxed);
                task.drain();
            }
        }
        Ok(())
    }

    /// Completes `item` after `delay`. See [`TimerService::delay`].
    pub fn delay(&self, delay: Duration, item: WorkItem) -> Option<TimerToken> {
        let timers = self.timers.lock().clone();
        match timers {
            Some(timers) => timers.delay(delay, item),
            None => {
                item.post(crate::item::CC_NORMAL);
                None
            }
        }
    }

    /// See [`TimerService::cancel`].
    pub fn cancel(&self, token: TimerToken) -> bool {
        let timers = self.timers.lock().clone();
        timers.is_some_and(|timers| timers.cancel(token))
    }

    /// Blocks until every item enqueued on `task` before this call has completed.
    pub fn chase(self: &Arc<Self>, task: &Arc<Task>) -> Result<i32, EnqueueError> {
        let wait = Wait::new();
        let done: Arc<dyn Done> = wait.clone();
        self.enqueue(task, WorkItem::chase().with_done(done))?;
        Ok(wait.wait())
    }

    /// Async form of [`DispatcherInner::chase`].
    pub fn chase_async(self: &Arc<Self>, task: &Arc<Task>) -> Result<CompletionHandle, EnqueueError> {
        let (done, handle) = completion();
        self.enqueue(task, WorkItem::chase().with_done(done))?;
        Ok(handle)
    }

    pub fn trace(self: &Arc<Self>, task: &Arc<Task>) -> Result<(), EnqueueError> {
        self.enqueue(task, WorkItem::trace())
    }

    /// Queues a reset: work already queued runs, work queued behind it is purged.
    pub fn reset_task(self: &Arc<Self>, task: &Arc<Task>) -> Result<(), EnqueueError> {
        self.enqueue(task, WorkItem::reset())
    }

    /// Shuts down: the timer service first (outstanding delays complete), then
    /// the pool (in-flight drains finish). Later calls do nothing.
    pub fn wait(&self) {
        debug!("dispatcher wait...");

        let timers = self.timers.lock().take();
        if let Some(timers) = timers {
            timers.close();
            timers.join();
        }

        let master = self.master.write().take();
        if let Some(master) = master {
            master.stop();
        }

        debug!("...dispatcher wait");
    }

    pub fn metrics(&self) -> DispatchMetrics {
        DispatchMetrics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            inline_drains: self.inline_drains.load(Ordering::Relaxed),
            pool: self.master.read().as_ref().map(|m| m.metrics()),
            timers: self.timers.lock().as_ref().map(|t| t.metrics()),
        }
    }

    /// Dumps the dispatcher state to the log at debug level.
    pub fn debug(&self) {
        let m = self.metrics();
        debug!(
            "dispatcher '{}': enqueued({}) rejected({}) inline_drains({})",
            self.config.thread_name, m.enqueued, m.rejected, m.inline_drains
        );
        match self.master.read().as_ref() {
            Some(master) => master.debug(),
            None => debug!("..master: stopped"),
        }
        match m.timers {
            Some(t) => debug!(
                "..timers: scheduled({}) fired({}) cancelled({}) outstanding({})",
                t.scheduled, t.fired, t.cancelled, t.outstanding
            ),
            None => debug!("..timers: stopped"),
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("dispatcher '{}' dropped without wait()", self.config.thread_name);
        }
        self.wait();
    }
}

impl std::fmt::Debug for DispatcherInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherInner")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}
