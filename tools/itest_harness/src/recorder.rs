use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{unix_millis, Clock};
use crate::session::current_session;
use crate::store::keys::output_sort_key;
use crate::store::{StateItem, StateStore};

const KEY_COLLISION_RETRIES: u32 = 3;

/// One observable effect recorded during a test. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutput {
    pub test_id: String,
    pub sequence_key: String,
    pub payload: Value,
    pub recorded_at_ms: u64,
}

impl TestOutput {
    pub fn from_item(item: &StateItem) -> Result<Self, HarnessError> {
        serde_json::from_value(item.body.clone()).map_err(|e| {
            HarnessError::Serialization(format!("output {}/{}: {e}", item.pk, item.sk))
        })
    }
}

/// Appends outputs to a test's output log. Pure inserts under fresh keys, so
/// any number of units may record concurrently without coordination.
#[derive(Clone)]
pub struct OutputRecorder {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl OutputRecorder {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn record(&self, test_id: &str, payload: Value) -> Result<TestOutput, HarnessError> {
        if test_id.trim().is_empty() {
            return Err(HarnessError::Precondition(
                "cannot record an output without a test id".to_string(),
            ));
        }
        for _ in 0..KEY_COLLISION_RETRIES {
            let at = self.clock.now();
            let output = TestOutput {
                test_id: test_id.to_string(),
                sequence_key: output_sort_key(at),
                payload: payload.clone(),
                recorded_at_ms: unix_millis(self.clock.as_ref()),
            };
            let body = serde_json::to_value(&output)
                .map_err(|e| HarnessError::Serialization(e.to_string()))?;
            let item = StateItem::new(test_id, output.sequence_key.clone(), body);
            // Insert-only: a colliding key must never overwrite another unit's output.
            if self.store.put_if_version(item, None)? {
                append_run_log(
                    "info",
                    "output.recorded",
                    json!({ "test_id": test_id, "sequence_key": output.sequence_key }),
                );
                return Ok(output);
            }
        }
        append_run_log(
            "error",
            "output.record.key_collision",
            json!({ "test_id": test_id }),
        );
        Err(HarnessError::StoreConflict {
            pk: test_id.to_string(),
            sk: "TestOutput-*".to_string(),
            attempts: KEY_COLLISION_RETRIES,
        })
    }

    /// Record against whatever session is current right now.
    pub fn record_current(&self, payload: Value) -> Result<TestOutput, HarnessError> {
        let session = current_session(self.store.as_ref())?;
        append_run_log(
            "debug",
            "output.record_current",
            json!({ "test_id": session.test_id }),
        );
        self.record(&session.test_id, payload)
    }
}
