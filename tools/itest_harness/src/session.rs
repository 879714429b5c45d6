//! Test session controller, used by the driver process.
//!
//! A session is announced by writing the singleton `Current` pointer. Units
//! under test find their inputs through that pointer alone, so only one
//! session can be current per store. Runs that must not interfere use
//! separate stores or run one after another.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::PollConfig;
use crate::errors::{HarnessError, PollTimeout};
use crate::logging::append_run_log;
use crate::mock::{load_mock_state, MockState};
use crate::recorder::TestOutput;
use crate::runtime::{unix_millis, Clock};
use crate::store::keys::{is_output_key, CURRENT, SESSION};
use crate::store::{StateItem, StateStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSession {
    pub test_id: String,
    pub inputs: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(250),
        }
    }
}

impl From<&PollConfig> for PollOptions {
    fn from(cfg: &PollConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            interval: Duration::from_millis(cfg.interval_ms),
        }
    }
}

/// Fresh test id: `T-<unix-ms>-<random hex>`.
pub fn new_test_id(clock: &dyn Clock) -> String {
    let suffix: u32 = rand::random();
    format!("T-{}-{suffix:08x}", unix_millis(clock))
}

/// Resolve the current session from the pointer partition.
///
/// The pointer is read with a partition query rather than a point get, so a
/// backend that ever stored two pointer rows is caught here instead of
/// silently serving one of them.
pub fn current_session(store: &dyn StateStore) -> Result<TestSession, HarnessError> {
    let pointers = store
        .query(CURRENT)?
        .into_iter()
        .filter(|item| item.sk == CURRENT)
        .collect::<Vec<_>>();
    match pointers.as_slice() {
        [] => Err(HarnessError::SessionNotFound),
        [pointer] => serde_json::from_value(pointer.body.clone())
            .map_err(|e| HarnessError::Serialization(format!("current pointer: {e}"))),
        many => {
            append_run_log(
                "error",
                "session.current.integrity_violation",
                json!({ "pointer_count": many.len() }),
            );
            Err(HarnessError::Integrity(format!(
                "{} records found for the current-session pointer",
                many.len()
            )))
        }
    }
}

pub struct SessionController {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl SessionController {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn start_session(&self, test_id: &str, inputs: Value) -> Result<TestSession, HarnessError> {
        if test_id.trim().is_empty() {
            return Err(HarnessError::Precondition("test id must not be empty".to_string()));
        }
        if test_id == CURRENT {
            return Err(HarnessError::Precondition(format!(
                "test id `{CURRENT}` is reserved for the session pointer"
            )));
        }

        let inputs_sha256 = inputs_digest(&inputs);
        let marker = StateItem::new(
            test_id,
            SESSION,
            json!({
                "testId": test_id,
                "startedAtMs": unix_millis(self.clock.as_ref()),
                "inputsSha256": inputs_sha256,
            }),
        );
        if !self.store.put_if_version(marker, None)? {
            append_run_log(
                "warn",
                "session.start.rejected",
                json!({ "test_id": test_id, "reason": "test id reused" }),
            );
            return Err(HarnessError::Precondition(format!(
                "test id `{test_id}` was already used by an earlier session"
            )));
        }

        let session = TestSession {
            test_id: test_id.to_string(),
            inputs,
        };
        let body = serde_json::to_value(&session)
            .map_err(|e| HarnessError::Serialization(e.to_string()))?;
        // Without the pointer the id was never used; release the marker.
        if let Err(error) = self.store.put(StateItem::new(CURRENT, CURRENT, body)) {
            let released = self.store.delete(test_id, SESSION).unwrap_or(false);
            append_run_log(
                "error",
                "session.start.pointer_failed",
                json!({
                    "test_id": test_id,
                    "marker_released": released,
                    "error": error.to_string(),
                }),
            );
            return Err(error);
        }
        append_run_log(
            "info",
            "session.started",
            json!({ "test_id": test_id, "inputs_sha256": inputs_sha256 }),
        );
        Ok(session)
    }

    pub fn current_session(&self) -> Result<TestSession, HarnessError> {
        current_session(self.store.as_ref())
    }

    /// Clear the pointer if it still names `test_id`. Outputs and mock state
    /// stay in the store. Returns whether the pointer was cleared.
    pub fn end_session(&self, test_id: &str) -> Result<bool, HarnessError> {
        let current = match current_session(self.store.as_ref()) {
            Ok(session) => session,
            Err(HarnessError::SessionNotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        if current.test_id != test_id {
            append_run_log(
                "warn",
                "session.end.not_current",
                json!({ "test_id": test_id, "current": current.test_id }),
            );
            return Ok(false);
        }
        let removed = self.store.delete(CURRENT, CURRENT)?;
        append_run_log("info", "session.ended", json!({ "test_id": test_id }));
        Ok(removed)
    }

    /// Everything recorded for `test_id` so far, oldest first.
    pub fn list_outputs(&self, test_id: &str) -> Result<Vec<TestOutput>, HarnessError> {
        let outputs = self
            .store
            .query(test_id)?
            .iter()
            .filter(|item| is_output_key(&item.sk))
            .map(TestOutput::from_item)
            .collect::<Result<Vec<_>, _>>()?;
        append_run_log(
            "debug",
            "session.outputs.listed",
            json!({ "test_id": test_id, "count": outputs.len() }),
        );
        Ok(outputs)
    }

    /// Block until `predicate` accepts the outputs seen so far, re-querying
    /// every `interval`. On expiry the partial result rides in the error.
    pub fn poll_outputs(
        &self,
        test_id: &str,
        predicate: impl Fn(&[TestOutput]) -> bool,
        options: &PollOptions,
    ) -> Result<Vec<TestOutput>, HarnessError> {
        if options.interval.is_zero() {
            return Err(HarnessError::Precondition(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let started = self.clock.now();
        let mut polls = 0u64;
        append_run_log(
            "debug",
            "session.poll.started",
            json!({
                "test_id": test_id,
                "timeout_ms": options.timeout.as_millis() as u64,
                "interval_ms": options.interval.as_millis() as u64,
            }),
        );

        loop {
            let outputs = self.list_outputs(test_id)?;
            polls += 1;
            let now = self.clock.now();
            let elapsed = elapsed_between(started, now);
            if predicate(&outputs) {
                append_run_log(
                    "info",
                    "session.poll.satisfied",
                    json!({
                        "test_id": test_id,
                        "outputs": outputs.len(),
                        "polls": polls,
                        "elapsed_ms": elapsed.as_millis() as u64,
                    }),
                );
                return Ok(outputs);
            }
            if elapsed >= options.timeout {
                append_run_log(
                    "warn",
                    "session.poll.timed_out",
                    json!({
                        "test_id": test_id,
                        "outputs": outputs.len(),
                        "polls": polls,
                        "elapsed_ms": elapsed.as_millis() as u64,
                    }),
                );
                return Err(HarnessError::Timeout(PollTimeout {
                    test_id: test_id.to_string(),
                    elapsed,
                    outputs,
                }));
            }
            let pause = options.interval.min(options.timeout - elapsed);
            let Some(wake) = now.checked_add(pause) else {
                return Err(HarnessError::Precondition(format!(
                    "poll pause of {}ms overflows the clock",
                    pause.as_millis()
                )));
            };
            self.clock.sleep_until(wake)?;
        }
    }

    pub fn poll_for_count(
        &self,
        test_id: &str,
        min_count: usize,
        options: &PollOptions,
    ) -> Result<Vec<TestOutput>, HarnessError> {
        self.poll_outputs(test_id, |outputs| outputs.len() >= min_count, options)
    }

    /// Replay cursor for one mock, for asserting how often it was consulted.
    pub fn mock_state(&self, test_id: &str, mock_id: &str) -> Result<MockState, HarnessError> {
        load_mock_state(self.store.as_ref(), test_id, mock_id).map(|(state, _)| state)
    }
}

fn inputs_digest(inputs: &Value) -> String {
    let hash = Sha256::digest(inputs.to_string().as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn elapsed_between(start: SystemTime, end: SystemTime) -> Duration {
    end.duration_since(start).unwrap_or(Duration::ZERO)
}
