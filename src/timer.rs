//! Delayed completion with cancellation.
//!
//! Producers append timer entries to a lock-free pending mailbox. A single
//! timer thread moves them into a deadline-ordered list that no other thread
//! ever touches, completes every entry whose deadline has passed, and sleeps
//! until the next deadline (or `timer_max_wait`).
//!
//! Cancellation is routed through the timer thread as well: a zero-delay
//! probe carrying a [`Wait`] is scheduled, and when it fires the timer thread
//! looks the target up in its own list. Either the normal firing or the
//! cancellation completes the delayed item, never both.

use super::{
    errors::DispatchError,
    handle::Wait,
    item::{Done, WorkItem, CC_ERROR, CC_NORMAL, FC_VALID},
    mailbox::Mailbox,
    model::TimerMetrics,
    pool::Config,
    signal::Signal,
};
use std::{
    collections::VecDeque,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};
use log::{debug, trace, warn};
use parking_lot::Mutex;


/// Opaque handle returned by [`TimerService::delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Reset,
    Start,
    Ready,
    Close,
}

enum Event {
    Fire(WorkItem),
    Cancel { target: TimerToken, probe: WorkItem },
}

struct Entry {
    deadline: Instant,
    token: TimerToken,
    event: Event,
}

// Saturates instead of panicking on absurd delays.
fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// Sorted by deadline; equal deadlines keep arrival order.
fn insert_sorted(list: &mut VecDeque<Entry>, entry: Entry) {
    let at = list
        .iter()
        .position(|e| e.deadline > entry.deadline)
        .unwrap_or(list.len());
    list.insert(at, entry);
}

pub struct TimerService {
    state: Mutex<TimerState>,
    pending: Mailbox<Entry>,
    signal: Signal,
    next_token: AtomicU64,
    max_wait: Duration,
    scheduled: AtomicUsize,
    fired: AtomicUsize,
    cancelled: AtomicUsize,
    forced: AtomicUsize,
    outstanding: AtomicUsize,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    /// Spawns the timer thread and returns once it is ready to accept delays.
    pub fn start(config: &Config) -> Result<Arc<Self>, DispatchError> {
        let service = Arc::new(Self {
            state: Mutex::new(TimerState::Start),
            pending: Mailbox::new(),
            signal: Signal::new(),
            next_token: AtomicU64::new(1),
            max_wait: config.timer_max_wait,
            scheduled: AtomicUsize::new(0),
            fired: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            forced: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            handle: Mutex::new(None),
        });

        let barrier = Arc::new(Barrier::new(2));
        let name = format!("{}-timer", config.thread_name);
        let runner = service.clone();
        let started = barrier.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let ready = {
                    let mut state = runner.state.lock();
                    if *state == TimerState::Start {
                        *state = TimerState::Ready;
                        true
                    } else {
                        false
                    }
                };
                started.wait();
                if ready {
                    runner.run();
                }
            });

        match spawned {
            Ok(handle) => *service.handle.lock() = Some(handle),
            Err(source) => {
                *service.state.lock() = TimerState::Reset;
                return Err(DispatchError::Spawn { name, source });
            }
        }

        barrier.wait();
        debug!("timer service ready");
        Ok(service)
    }

    pub fn state(&self) -> TimerState {
        *self.state.lock()
    }

    /// Schedules `item` to complete with `CC_NORMAL` after `delay`.
    ///
    /// When the service is not ready the item completes immediately and no
    /// token is returned.
    pub fn delay(&self, delay: Duration, item: WorkItem) -> Option<TimerToken> {
        let state = self.state.lock();
        if *state != TimerState::Ready {
            drop(state);
            trace!("timer not ready, completing delayed item now");
            item.post(CC_NORMAL);
            return None;
        }

        let token = self.token();
        let entry = Entry {
            deadline: deadline_after(Instant::now(), delay),
            token,
            event: Event::Fire(item),
        };
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        if self.pending.push(entry) {
            self.signal.post();
        }
        Some(token)
    }

    /// Completes the item behind `token` with `CC_ERROR` if it has not fired
    /// yet. Returns `false` when there was nothing left to cancel.
    ///
    /// Blocks until the timer thread has processed the request, so it must
    /// not be called from a completion running on the timer thread.
    pub fn cancel(&self, token: TimerToken) -> bool {
        if self.is_timer_thread() {
            warn!("cancel({:?}) from the timer thread ignored", token);
            return false;
        }

        let wait = Wait::new();
        let done: Arc<dyn Done> = wait.clone();
        {
            let state = self.state.lock();
            if *state != TimerState::Ready {
                return false;
            }

            let entry = Entry {
                deadline: Instant::now(),
                token: self.token(),
                event: Event::Cancel {
                    target: token,
                    probe: WorkItem::new(FC_VALID).with_done(done),
                },
            };
            if self.pending.push(entry) {
                self.signal.post();
            }
        }

        wait.wait() == CC_NORMAL
    }

    /// Asks the timer thread to finish. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TimerState::Start | TimerState::Ready) {
            *state = TimerState::Close;
            self.signal.post();
        }
    }

    pub fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("timer thread panicked");
        }
    }

    pub fn metrics(&self) -> TimerMetrics {
        TimerMetrics {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }

    fn token(&self) -> TimerToken {
        TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn is_timer_thread(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    fn run(&self) {
        let mut list: VecDeque<Entry> = VecDeque::new();

        loop {
            if !self.pending.is_idle() {
                self.pending.drain(
                    |entry| {
                        insert_sorted(&mut list, entry);
                        ControlFlow::Continue(())
                    },
                    |_| {},
                );
            }

            let mut now = Instant::now();
            while list.front().is_some_and(|e| e.deadline <= now) {
                if let Some(entry) = list.pop_front() {
                    self.expire(entry, &mut list);
                }
                now = Instant::now();
            }

            // A close after this check posts the signal, so the next pass sees it.
            if *self.state.lock() != TimerState::Ready {
                break;
            }

            let wait = list
                .front()
                .map(|e| e.deadline.saturating_duration_since(now))
                .map_or(self.max_wait, |d| d.min(self.max_wait));
            self.signal.wait_timeout(wait);
        }

        *self.state.lock() = TimerState::Reset;
        debug!("timer service closing, {} entries left", list.len() + self.pending.len());

        let rest = self.pending.take_all();
        for entry in list.into_iter().chain(rest) {
            match entry.event {
                Event::Fire(item) => {
                    self.forced.fetch_add(1, Ordering::Relaxed);
                    self.outstanding.fetch_sub(1, Ordering::Relaxed);
                    item.post(CC_NORMAL);
                }
                Event::Cancel { probe, .. } => probe.post(CC_ERROR),
            }
        }
        debug!("timer service terminated");
    }

    fn expire(&self, entry: Entry, list: &mut VecDeque<Entry>) {
        match entry.event {
            Event::Fire(item) => {
                self.fired.fetch_add(1, Ordering::Relaxed);
                self.outstanding.fetch_sub(1, Ordering::Relaxed);
                item.post(CC_NORMAL);
            }
            Event::Cancel { target, probe } => {
                let found = list
                    .iter()
                    .position(|e| e.token == target && matches!(e.event, Event::Fire(_)));
                let cc = match found.and_then(|at| list.remove(at)) {
                    Some(Entry { event: Event::Fire(item), .. }) => {
                        self.cancelled.fetch_add(1, Ordering::Relaxed);
                        self.outstanding.fetch_sub(1, Ordering::Relaxed);
                        item.post(CC_ERROR);
                        CC_NORMAL
                    }
                    _ => CC_ERROR,
                };
                probe.post(cc);
            }
        }
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("state", &self.state())
            .field("metrics", &self.metrics())
            .finish()
    }
}
