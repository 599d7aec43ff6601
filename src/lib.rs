//! In-process work dispatcher with strictly ordered tasks.
//!
//! # Features
//! - Named [`Task`] queues: items on one task run one at a time, in arrival order
//! - On-demand thread pool: a task with pending work gets a parked or new thread
//! - Delayed completion with race-free cancellation
//! - Blocking ([`Wait`]) and async ([`handle::completion`]) completion callbacks
//! - Cooperative, idempotent shutdown
//! - Pool and timer metrics
//!
//! ```no_run
//! use std::sync::Arc;
//! use task_dispatch::{DispatcherInner, Done, Task, Wait, WorkItem, CC_NORMAL};
//!
//! let dispatcher = DispatcherInner::new().unwrap();
//! let task = Task::new("echo", |item: WorkItem| item.post(CC_NORMAL));
//!
//! let wait = Wait::new();
//! let done: Arc<dyn Done> = wait.clone();
//! dispatcher.enqueue(&task, WorkItem::new(1).with_done(done)).unwrap();
//! assert_eq!(wait.wait(), CC_NORMAL);
//!
//! dispatcher.wait();
//! ```

pub mod dispatcher;
pub mod errors;
pub mod handle;
pub mod item;
pub mod mailbox;
pub mod model;
pub mod pool;
pub mod signal;
pub mod task;
pub mod timer;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherInner};
pub use errors::{DispatchError, EnqueueError};
pub use handle::{completion, CompletionHandle, Wait};
pub use item::{
    Done, WorkItem,
    CC_ERROR, CC_INVALID_FC, CC_NORMAL, CC_PURGE,
    FC_CHASE, FC_RESET, FC_TRACE, FC_VALID,
};
pub use pool::Config;
pub use task::{Task, TaskState, Work};
pub use timer::{TimerState, TimerToken};
