//! Shared test state store.
//!
//! Every record the harness keeps lives in one partitioned key/value space:
//!
//! | pk         | sk                      | record                      |
//! |------------|-------------------------|-----------------------------|
//! | `Current`  | `Current`               | pointer to the running test |
//! | `<testId>` | `Session`               | session marker              |
//! | `<testId>` | `TestOutput-<unique>`   | one recorded output         |
//! | `<testId>` | `MockState-<mockId>`    | replay cursor for one mock  |
//!
//! Backends only need single-item get/put/delete and a single-partition range
//! query ordered by sort key. `put_if_version` is the conditional write used
//! wherever a read-modify-write must not lose updates.

pub mod keys;
pub mod memory;
pub mod sqlite;

use serde_json::Value;

use crate::errors::HarnessError;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

pub type StoreResult<T> = Result<T, HarnessError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StateItem {
    pub pk: String,
    pub sk: String,
    pub body: Value,
    /// Maintained by the store: 1 after the first write, +1 on every write.
    /// Ignored on input.
    pub version: i64,
}

impl StateItem {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, body: Value) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            body,
            version: 0,
        }
    }
}

pub trait StateStore: Send + Sync {
    fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<StateItem>>;

    /// Unconditional overwrite by `(pk, sk)`.
    fn put(&self, item: StateItem) -> StoreResult<()>;

    /// Write only if the stored version equals `expected`; `None` means the
    /// item must not exist yet. Returns `false` when the condition failed.
    fn put_if_version(&self, item: StateItem, expected: Option<i64>) -> StoreResult<bool>;

    /// All items in partition `pk`, ascending by sort key.
    fn query(&self, pk: &str) -> StoreResult<Vec<StateItem>>;

    /// Returns `true` when an item was removed.
    fn delete(&self, pk: &str, sk: &str) -> StoreResult<bool>;
}
