pub mod backend;
pub mod event_log;
pub mod memory;
pub mod redb_store;

pub use backend::{SnapshotStore, StoreError};
pub use event_log::JsonlEventLog;
pub use memory::InMemorySnapshotStore;
pub use redb_store::RedbSnapshotStore;
