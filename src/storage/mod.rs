pub mod action;
mod error;
pub mod offline_queue;
pub mod sled_store;
pub mod store;

pub use self::action::{
    ActionError, Mutation, OperationKind, Patch, QueuedAction, Record, RecordRef, RowId,
};
pub use self::error::StorageError;
pub use self::offline_queue::{
    DrainReport, DropReason, DroppedAction, OfflineQueue, OverflowStrategy,
};
pub use self::sled_store::SledStore;
pub use self::store::{FileStore, MemoryStore, QueueStore};
