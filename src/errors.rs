use super::item::WorkItem;
use thiserror::Error;


#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task '{task}' is bound to a different dispatcher")]
    WrongDispatcher { task: String },

    #[error("task '{task}' is not bound to a dispatcher")]
    Unbound { task: String },

    #[error("failed to spawn thread '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("completion channel closed before the item was posted")]
    ChannelClosed,

    #[error("timed out waiting for completion")]
    Timeout,
}

/// A rejected enqueue. The item is handed back untouched so the caller
/// still owns it and can complete it or try elsewhere.
#[derive(Debug, Error)]
#[error("enqueue rejected: {reason}")]
pub struct EnqueueError {
    pub item: WorkItem,
    #[source]
    pub reason: DispatchError,
}

impl EnqueueError {
    pub fn new(item: WorkItem, reason: DispatchError) -> Self {
        Self { item, reason }
    }

    #[inline]
    pub fn into_item(self) -> WorkItem {
        self.item
    }
}
