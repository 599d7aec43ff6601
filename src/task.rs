//! Strictly ordered work queues.
//!
//! A [`Task`] owns an inbox of [`WorkItem`]s and a [`Work`] hook. Items are
//! handed to the hook one at a time in arrival order, and never from two
//! threads at once: the producer whose enqueue wakes an idle inbox schedules
//! the task, and whoever drains it keeps ownership until the inbox is
//! observably empty again.
//!
//! The hook runs to completion once started. It is expected to `post` every
//! item it receives; a hook that panics loses the item it was given.

use super::{
    dispatcher::DispatcherInner,
    errors::{DispatchError, EnqueueError},
    item::{
        WorkItem,
        CC_INVALID_FC, CC_NORMAL, CC_PURGE,
        FC_CHASE, FC_RESET, FC_TRACE, FC_VALID,
    },
    mailbox::Mailbox,
};
use std::{
    fmt,
    ops::ControlFlow,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;


/// Application hook invoked for every non-control item.
pub trait Work: Send + Sync {
    fn work(&self, item: WorkItem);
}

impl<F> Work for F
where
    F: Fn(WorkItem) + Send + Sync,
{
    #[inline]
    fn work(&self, item: WorkItem) {
        self(item)
    }
}

struct Echo;

impl Work for Echo {
    fn work(&self, item: WorkItem) {
        item.post(CC_NORMAL);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Reset = 0,
    Active = 1,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Active,
            _ => TaskState::Reset,
        }
    }
}

pub struct Task {
    name: String,
    inbox: Mailbox<WorkItem>,
    owner: Mutex<Option<Weak<DispatcherInner>>>,
    state: AtomicU8,
    handler: Box<dyn Work>,
    drains: AtomicUsize,
    processed: AtomicUsize,
    purged: AtomicUsize,
    panics: AtomicUsize,
}

impl Task {
    pub fn new<W>(name: impl Into<String>, work: W) -> Arc<Self>
    where
        W: Work + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            inbox: Mailbox::new(),
            owner: Mutex::new(None),
            state: AtomicU8::new(TaskState::Reset as u8),
            handler: Box::new(work),
            drains: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            purged: AtomicUsize::new(0),
            panics: AtomicUsize::new(0),
        })
    }

    /// A task whose hook completes every item with `CC_NORMAL`.
    pub fn echo(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Echo)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Items enqueued but not yet taken by a drain.
    #[inline]
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn purged(&self) -> usize {
        self.purged.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }

    /// Forwards to the dispatcher this task is bound to.
    pub fn enqueue(self: &Arc<Self>, item: WorkItem) -> Result<(), EnqueueError> {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.enqueue(self, item),
            None => Err(EnqueueError::new(
                item,
                DispatchError::Unbound { task: self.name.clone() },
            )),
        }
    }

    /// The bound dispatcher, if it is still alive.
    pub fn dispatcher(&self) -> Option<Arc<DispatcherInner>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Clears the dispatcher binding and returns to [`TaskState::Reset`].
    ///
    /// Queued items are not touched; enqueue a [`WorkItem::reset`] to purge
    /// them in order.
    pub fn reset(&self) {
        debug!("task '{}' reset, state {:?}", self.name, self.state());
        let mut owner = self.owner.lock();
        *owner = None;
        self.state.store(TaskState::Reset as u8, Ordering::Release);
    }

    /// Binds to `dispatcher` on first use. A task stays with one live
    /// dispatcher until it is reset.
    ///
    /// Once the bound dispatcher has been dropped the binding is stale and
    /// the next dispatcher to enqueue takes the task over, so a task outlives
    /// a single dispatcher. State and binding only change under the `owner`
    /// lock.
    pub(crate) fn bind(&self, dispatcher: &Arc<DispatcherInner>) -> Result<(), DispatchError> {
        let mut owner = self.owner.lock();
        if let Some(current) = owner.as_ref() {
            if current.strong_count() > 0 {
                if std::ptr::eq(current.as_ptr(), Arc::as_ptr(dispatcher)) {
                    return Ok(());
                }
                return Err(DispatchError::WrongDispatcher { task: self.name.clone() });
            }
        }

        *owner = Some(Arc::downgrade(dispatcher));
        self.state.store(TaskState::Active as u8, Ordering::Release);
        Ok(())
    }

    /// Appends to the inbox; `true` means the task just became ready.
    #[inline]
    pub(crate) fn push(&self, item: WorkItem) -> bool {
        self.inbox.push(item)
    }

    /// Processes the inbox until it is observably empty.
    ///
    /// Only the owner of the current drain may call this: the thread that saw
    /// [`Task::push`] report the task ready, or the pool thread it was handed to.
    pub(crate) fn drain(&self) {
        if self.inbox.is_idle() {
            return;
        }

        self.drains.fetch_add(1, Ordering::Relaxed);
        self.inbox.drain(
            |item| self.dispatch(item),
            |item| {
                self.purged.fetch_add(1, Ordering::Relaxed);
                item.post(CC_PURGE);
            },
        );
    }

    fn dispatch(&self, item: WorkItem) -> ControlFlow<()> {
        if !item.is_control() {
            self.processed.fetch_add(1, Ordering::Relaxed);
            let res = catch_unwind(AssertUnwindSafe(|| self.handler.work(item)));
            if res.is_err() {
                self.panics.fetch_add(1, Ordering::Relaxed);
                error!("task '{}': work handler panicked, item lost", self.name);
            }
            return ControlFlow::Continue(());
        }

        let cc = match item.fc() {
            FC_CHASE | FC_VALID => CC_NORMAL,
            FC_TRACE => {
                info!("task '{}': trace {:?}, {} pending", self.name, item, self.pending());
                CC_NORMAL
            }
            FC_RESET => {
                self.reset();
                item.post(CC_NORMAL);
                return ControlFlow::Break(());
            }
            _ => CC_INVALID_FC,
        };
        item.post(cc);
        ControlFlow::Continue(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.state() != TaskState::Reset {
            if self.dispatcher().is_some() {
                warn!("task '{}' dropped while active, forcing reset", self.name);
            }
            self.reset();
        }

        for item in self.inbox.take_all() {
            item.post(CC_PURGE);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("drains", &self.drains())
            .field("processed", &self.processed())
            .finish()
    }
}
