//! Multi-producer, single-consumer inbox with a built-in scheduling trigger.
//!
//! Producers append with [`Mailbox::push`]. The push that moves the pending
//! count from zero to one is told so, and that caller is responsible for
//! getting the mailbox drained. Exactly one drain is then in flight until the
//! count drops back to zero, at which point the drainer gives up ownership.
//!
//! The count is bumped only after the value is in the queue, so a drainer
//! that owns a counted unit always finds something to pop. A producer racing
//! with the final decrement either lands inside the current drain (its unit
//! was counted before the decrement) or observes zero and schedules a fresh
//! drain.

use crossbeam::{
    queue::SegQueue,
    utils::Backoff,
};
use std::{
    ops::ControlFlow,
    sync::atomic::{AtomicUsize, Ordering},
};

#[inline(always)]
fn unlikely(b: bool) -> bool {
    #[cold]
    fn cold() {}
    if b { cold() }
    b
}

pub struct Mailbox<T> {
    queue: SegQueue<T>,
    pending: AtomicUsize,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Appends `value`. Returns `true` when the mailbox was idle, i.e. the
    /// caller must schedule a drain.
    #[inline]
    pub fn push(&self, value: T) -> bool {
        self.queue.push(value);
        self.pending.fetch_add(1, Ordering::AcqRel) == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.len() == 0
    }

    /// Drains until the mailbox is observably empty.
    ///
    /// Must only be called by the current owner of the drain (the caller that
    /// saw `push` return `true`, or a dedicated single consumer that saw a
    /// non-zero `len`). Once `visit` breaks, every remaining counted value goes
    /// to `discard` instead.
    pub fn drain<V, D>(&self, mut visit: V, mut discard: D)
    where
        V: FnMut(T) -> ControlFlow<()>,
        D: FnMut(T),
    {
        let mut purging = false;
        loop {
            let value = self.pop_counted();
            if purging {
                discard(value);
            } else if visit(value).is_break() {
                purging = true;
            }

            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }

    /// Takes everything still queued, counted or not. Only valid once no
    /// producer can reach the mailbox any more.
    pub fn take_all(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(v) = self.queue.pop() {
            out.push(v);
        }
        self.pending.store(0, Ordering::Release);
        out
    }

    fn pop_counted(&self) -> T {
        let backoff = Backoff::new();
        loop {
            if let Some(v) = self.queue.pop() {
                return v;
            }
            // A counted unit always has its value published first; an empty
            // pop here is only a momentary view of a concurrent push.
            if unlikely(backoff.is_completed()) {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.len())
            .finish()
    }
}
