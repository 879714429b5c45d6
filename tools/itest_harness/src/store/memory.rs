use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::store::{StateItem, StateStore, StoreResult};

/// In-process store with the same semantics as the SQLite backend. Useful
/// when the driver and every unit under test share one process.
#[derive(Default)]
pub struct MemoryStateStore {
    items: Mutex<BTreeMap<(String, String), (Value, i64)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> StoreResult<std::sync::MutexGuard<'_, BTreeMap<(String, String), (Value, i64)>>> {
        self.items
            .lock()
            .map_err(|_| HarnessError::Database("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<StateItem>> {
        append_run_log("debug", "store.memory.get", json!({ "pk": pk, "sk": sk }));
        let items = self.lock()?;
        Ok(items
            .get(&(pk.to_string(), sk.to_string()))
            .map(|(body, version)| StateItem {
                pk: pk.to_string(),
                sk: sk.to_string(),
                body: body.clone(),
                version: *version,
            }))
    }

    fn put(&self, item: StateItem) -> StoreResult<()> {
        append_run_log(
            "debug",
            "store.memory.put",
            json!({ "pk": item.pk, "sk": item.sk }),
        );
        let mut items = self.lock()?;
        let entry = items.entry((item.pk, item.sk)).or_insert((Value::Null, 0));
        entry.0 = item.body;
        entry.1 += 1;
        Ok(())
    }

    fn put_if_version(&self, item: StateItem, expected: Option<i64>) -> StoreResult<bool> {
        let mut items = self.lock()?;
        let key = (item.pk, item.sk);
        let current = items.get(&key).map(|(_, version)| *version);
        if current != expected {
            append_run_log(
                "warn",
                "store.put.conflict",
                json!({ "pk": key.0, "sk": key.1, "expected": expected, "actual": current }),
            );
            return Ok(false);
        }
        items.insert(key, (item.body, current.unwrap_or(0) + 1));
        Ok(true)
    }

    fn query(&self, pk: &str) -> StoreResult<Vec<StateItem>> {
        append_run_log("debug", "store.memory.query", json!({ "pk": pk }));
        let items = self.lock()?;
        // Tuple ordering keeps each partition contiguous and sorted by sk.
        Ok(items
            .range((pk.to_string(), String::new())..)
            .take_while(|((item_pk, _), _)| item_pk == pk)
            .map(|((item_pk, sk), (body, version))| StateItem {
                pk: item_pk.clone(),
                sk: sk.clone(),
                body: body.clone(),
                version: *version,
            })
            .collect())
    }

    fn delete(&self, pk: &str, sk: &str) -> StoreResult<bool> {
        let mut items = self.lock()?;
        Ok(items.remove(&(pk.to_string(), sk.to_string())).is_some())
    }
}
