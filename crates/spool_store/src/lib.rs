//! Storage core for the spool broker: the durable append path with grouped
//! fsync, the per-queue journal, the FIFO queue engine with reliable-read
//! reservations, and the queue container shared by every session.

mod collection;
mod journal;
pub mod metrics;
mod queue;
mod sync_file;

pub use collection::{CollectionConfig, QueueCollection, RemoveOutcome, WaiterToken};
pub use journal::{Journal, JournalOp};
pub use queue::{QItem, QueueLimits};
pub use sync_file::{PeriodicSyncFile, StorageError, SyncPolicy, SyncReceipt};
