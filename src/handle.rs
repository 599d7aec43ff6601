use super::{
    errors::DispatchError,
    item::{Done, WorkItem},
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;


/// Blocking completion slot. Attach it to an item as its [`Done`], then block
/// on [`Wait::wait`] from the producer thread.
///
/// Completion is a broadcast: every thread blocked in `wait` is released and
/// the slot keeps the item until [`Wait::take`] or [`Wait::reset`]. The stored
/// item has its `Done` detached, so it holds no reference back to the `Wait`.
#[derive(Default)]
pub struct Wait {
    slot: Mutex<Option<WorkItem>>,
    cond: Condvar,
}

impl Wait {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until the attached item completes and returns its completion code.
    pub fn wait(&self) -> i32 {
        let mut slot = self.slot.lock();
        loop {
            if let Some(item) = slot.as_ref() {
                return item.cc();
            }
            self.cond.wait(&mut slot);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(item) = slot.as_ref() {
                return Some(item.cc());
            }
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.as_ref().map(WorkItem::cc);
            }
        }
    }

    /// Hands back the completed item, leaving the slot empty.
    pub fn take(&self) -> Option<WorkItem> {
        self.slot.lock().take()
    }

    pub fn is_complete(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Clears the slot so the `Wait` can serve another operation.
    pub fn reset(&self) {
        *self.slot.lock() = None;
    }
}

impl Done for Wait {
    fn on_done(&self, mut item: WorkItem) {
        item.set_done(None);
        let mut slot = self.slot.lock();
        *slot = Some(item);
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for Wait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wait")
            .field("complete", &self.is_complete())
            .finish()
    }
}


struct OneshotDone {
    sender: Mutex<Option<oneshot::Sender<WorkItem>>>,
}

impl Done for OneshotDone {
    fn on_done(&self, item: WorkItem) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(item);
        }
    }
}

/// Creates an async completion pair: attach the [`Done`] half to an item and
/// await the [`CompletionHandle`].
pub fn completion() -> (Arc<dyn Done>, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    let done = Arc::new(OneshotDone {
        sender: Mutex::new(Some(tx)),
    });
    (done, CompletionHandle::new(rx))
}

/// Future resolving to the completed item.
pub struct CompletionHandle {
    receiver: oneshot::Receiver<WorkItem>,
}

impl CompletionHandle {

    pub fn new
    (
        receiver: oneshot::Receiver<WorkItem>,
    ) -> Self {
        Self {
            receiver
        }
    }

    pub async fn await_timeout(self, timeout: Duration) -> Result<WorkItem, DispatchError> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(item)) => Ok(item),
            Ok(Err(_)) => Err(DispatchError::ChannelClosed),
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    /// Blocks the current thread. Must not be called from inside an async runtime.
    pub fn blocking_wait(self) -> Result<WorkItem, DispatchError> {
        self.receiver
            .blocking_recv()
            .map_err(|_| DispatchError::ChannelClosed)
    }
}

impl Future for CompletionHandle {
    type Output = Result<WorkItem, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.receiver.poll_unpin(cx) {
            Poll::Ready(res) => Poll::Ready(res.map_err(|_| DispatchError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{CC_ERROR, CC_NORMAL};
    use std::thread;

    #[test]
    fn wait_releases_on_post_and_resets() {
        let wait = Wait::new();
        let done: Arc<dyn Done> = wait.clone();

        let item = WorkItem::new(1).with_done(done);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            item.post(CC_ERROR);
        });

        assert_eq!(wait.wait(), CC_ERROR);
        handle.join().unwrap();

        let mut item = wait.take().expect("completed item");
        assert_eq!(item.fc(), 1);
        assert!(!item.has_done());
        assert!(!wait.is_complete());

        wait.reset();
        assert_eq!(wait.wait_timeout(Duration::from_millis(5)), None);

        let done: Arc<dyn Done> = wait.clone();
        item.set_done(Some(done));
        item.post(CC_NORMAL);
        assert_eq!(wait.wait_timeout(Duration::from_millis(5)), Some(CC_NORMAL));
    }

    #[test]
    fn completed_wait_is_freed() {
        let wait = Wait::new();
        let weak = Arc::downgrade(&wait);
        let done: Arc<dyn Done> = wait.clone();

        WorkItem::new(0).with_done(done).post(CC_NORMAL);
        assert_eq!(wait.wait(), CC_NORMAL);
        assert!(wait.is_complete());

        drop(wait);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn wait_releases_every_waiter() {
        let wait = Wait::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let wait = wait.clone();
                thread::spawn(move || wait.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        let done: Arc<dyn Done> = wait.clone();
        WorkItem::new(0).with_done(done).post(CC_ERROR);

        for w in waiters {
            assert_eq!(w.join().unwrap(), CC_ERROR);
        }
        assert!(wait.is_complete());
    }

    #[tokio::test]
    async fn completion_handle_resolves() {
        let (done, handle) = completion();
        WorkItem::new(3).with_done(done).post(7);
        let item = handle.await.unwrap();
        assert_eq!(item.cc(), 7);
        assert_eq!(item.fc(), 3);
    }

    #[tokio::test]
    async fn completion_handle_closed_when_item_dropped() {
        let (done, handle) = completion();
        drop(done);
        assert!(matches!(handle.await, Err(DispatchError::ChannelClosed)));
    }

    #[tokio::test]
    async fn completion_handle_times_out() {
        let (_done, handle) = completion();
        let res = handle.await_timeout(Duration::from_millis(10)).await;
        assert!(matches!(res, Err(DispatchError::Timeout)));
    }
}
