//! Record store capability and its backends.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::MemoryRecordStore;
pub use sql::SqlRecordStore;
pub use traits::{RecordId, RecordStore, StoreError, StoredRecord};
