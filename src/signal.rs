use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};


/// Binary wake signal. Posting an already posted signal is a no-op; a wait
/// consumes the post.
#[derive(Debug, Default)]
pub struct Signal {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut posted = self.posted.lock();
        *posted = true;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.cond.wait(&mut posted);
        }
        *posted = false;
    }

    /// Returns `true` if the signal was posted, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut posted = self.posted.lock();
        while !*posted {
            if self.cond.wait_until(&mut posted, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *posted, false)
    }
}
