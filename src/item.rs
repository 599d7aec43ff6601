//! Work items and completion callbacks.
//!
//! A [`WorkItem`] is moved through the dispatcher by value. Completing it with
//! [`WorkItem::post`] consumes it, so an item can only ever be completed once:
//! either it is handed to its [`Done`] callback or, with no callback attached,
//! it is dropped.

use std::{
    any::Any,
    fmt,
    sync::Arc,
};

/// Flush barrier: completes normally once every earlier item has completed.
pub const FC_CHASE: i32 = -1;
/// Logs the item and completes normally.
pub const FC_TRACE: i32 = -2;
/// Resets the task and purges everything queued behind it.
pub const FC_RESET: i32 = -3;
/// Internal no-op probe (timer cancellation round trip).
pub const FC_VALID: i32 = -4;

pub const CC_NORMAL: i32 = 0;
pub const CC_ERROR: i32 = -1;
pub const CC_INVALID_FC: i32 = -2;
/// The item was discarded without reaching `work()`.
pub const CC_PURGE: i32 = -3;

/// Completion callback, invoked exactly once per completed item.
pub trait Done: Send + Sync {
    fn on_done(&self, item: WorkItem);
}

impl<F> Done for F
where
    F: Fn(WorkItem) + Send + Sync,
{
    #[inline]
    fn on_done(&self, item: WorkItem) {
        self(item)
    }
}

pub struct WorkItem {
    fc: i32,
    cc: i32,
    done: Option<Arc<dyn Done>>,
    payload: Option<Box<dyn Any + Send>>,
}

impl WorkItem {
    pub fn new(fc: i32) -> Self {
        Self {
            fc,
            cc: CC_NORMAL,
            done: None,
            payload: None,
        }
    }

    pub fn with_done(mut self, done: Arc<dyn Done>) -> Self {
        self.done = Some(done);
        self
    }

    pub fn with_payload<T: Any + Send>(mut self, payload: T) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    pub fn chase() -> Self {
        Self::new(FC_CHASE)
    }

    pub fn trace() -> Self {
        Self::new(FC_TRACE)
    }

    pub fn reset() -> Self {
        Self::new(FC_RESET)
    }

    #[inline]
    pub fn fc(&self) -> i32 {
        self.fc
    }

    #[inline]
    pub fn cc(&self) -> i32 {
        self.cc
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.fc < 0
    }

    pub fn set_fc(&mut self, fc: i32) {
        self.fc = fc;
    }

    pub fn set_done(&mut self, done: Option<Arc<dyn Done>>) {
        self.done = done;
    }

    pub fn has_done(&self) -> bool {
        self.done.is_some()
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    /// Removes the payload if it has type `T`; a payload of another type is left in place.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        match self.payload.take() {
            Some(p) => match p.downcast::<T>() {
                Ok(v) => Some(*v),
                Err(p) => {
                    self.payload = Some(p);
                    None
                }
            },
            None => None,
        }
    }

    /// Completes the item with `cc`.
    ///
    /// The attached [`Done`] receives the item by value; without one the item
    /// is dropped here.
    pub fn post(mut self, cc: i32) {
        self.cc = cc;
        match self.done.clone() {
            Some(done) => done.on_done(self),
            None => drop(self),
        }
    }
}

impl Default for WorkItem {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("fc", &self.fc)
            .field("cc", &self.cc)
            .field("done", &self.done.is_some())
            .field("payload", &self.payload.is_some())
            .finish()
    }
}
