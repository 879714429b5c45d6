//! Mock replay client, used inside a mocked external dependency.
//!
//! Each mock identity owns an ordered script in the session inputs
//! (`inputs.mocks[<mockId>]`). The n-th call returns the n-th scripted
//! response; the cursor lives in the store so separate invocations of the
//! mock handler share it. Selection is by call order only, so the test author
//! must know the exact order in which the dependency is consulted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::session::current_session;
use crate::store::keys::mock_state_key;
use crate::store::{StateItem, StateStore};

pub const DEFAULT_CONFLICT_RETRIES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockExchange {
    pub response: Value,
    /// Only checked by `next_response_for`; never used to pick an exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_matcher: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockState {
    pub invocation_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The scripted exchanges for `mock_id` in a session's inputs.
pub fn mock_script(inputs: &Value, mock_id: &str) -> Result<Vec<MockExchange>, HarnessError> {
    let Some(script) = inputs
        .get("mocks")
        .and_then(|mocks| mocks.get(mock_id))
        .filter(|script| !script.is_null())
    else {
        append_run_log(
            "error",
            "mock.unconfigured",
            json!({ "mock_id": mock_id }),
        );
        return Err(HarnessError::UnconfiguredMock {
            mock_id: mock_id.to_string(),
        });
    };
    serde_json::from_value(script.clone())
        .map_err(|e| HarnessError::Serialization(format!("script for mock `{mock_id}`: {e}")))
}

/// Current cursor plus the store version it was read at (`None` if unset).
pub fn load_mock_state(
    store: &dyn StateStore,
    test_id: &str,
    mock_id: &str,
) -> Result<(MockState, Option<i64>), HarnessError> {
    let item = store.get(test_id, &mock_state_key(mock_id))?;
    append_run_log(
        "debug",
        "mock.state.loaded",
        json!({
            "test_id": test_id,
            "mock_id": mock_id,
            "version": item.as_ref().map(|i| i.version),
        }),
    );
    match item {
        None => Ok((MockState::default(), None)),
        Some(item) => {
            let state = serde_json::from_value(item.body).map_err(|e| {
                HarnessError::Serialization(format!("state for mock `{mock_id}`: {e}"))
            })?;
            Ok((state, Some(item.version)))
        }
    }
}

pub struct MockReplayClient {
    store: Arc<dyn StateStore>,
    mock_id: String,
    max_conflict_retries: u32,
}

impl MockReplayClient {
    pub fn new(store: Arc<dyn StateStore>, mock_id: impl Into<String>) -> Self {
        Self {
            store,
            mock_id: mock_id.into(),
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries.max(1);
        self
    }

    pub fn next_response(&self) -> Result<Value, HarnessError> {
        self.advance(None).map(|exchange| exchange.response)
    }

    /// Like `next_response`, but first checks the scripted `requestMatcher`
    /// (if any) against `request`. A mismatch does not consume the exchange.
    pub fn next_response_for(&self, request: &Value) -> Result<Value, HarnessError> {
        self.advance(Some(request)).map(|exchange| exchange.response)
    }

    fn advance(&self, request: Option<&Value>) -> Result<MockExchange, HarnessError> {
        let session = current_session(self.store.as_ref())?;
        let script = mock_script(&session.inputs, &self.mock_id)?;
        let key = mock_state_key(&self.mock_id);

        // Conditional write on the version we read; a concurrent invocation of
        // the same mock makes the write fail and we re-read the cursor.
        for attempt in 1..=self.max_conflict_retries {
            let (state, version) =
                load_mock_state(self.store.as_ref(), &session.test_id, &self.mock_id)?;
            let index = state.invocation_count;
            let Some(exchange) = usize::try_from(index)
                .ok()
                .and_then(|i| script.get(i))
                .cloned()
            else {
                append_run_log(
                    "error",
                    "mock.script.exhausted",
                    json!({
                        "test_id": session.test_id,
                        "mock_id": self.mock_id,
                        "invocation_count": index,
                        "script_len": script.len(),
                    }),
                );
                return Err(HarnessError::ScriptExhausted {
                    mock_id: self.mock_id.clone(),
                    invocation_count: index,
                    script_len: script.len(),
                });
            };

            if let (Some(request), Some(matcher)) = (request, exchange.request_matcher.as_ref()) {
                if let Some(reason) = subset_mismatch(matcher, request, "$") {
                    append_run_log(
                        "error",
                        "mock.request.mismatch",
                        json!({
                            "test_id": session.test_id,
                            "mock_id": self.mock_id,
                            "index": index,
                            "reason": reason,
                        }),
                    );
                    return Err(HarnessError::MockRequestMismatch {
                        mock_id: self.mock_id.clone(),
                        index,
                        reason,
                    });
                }
            }

            let next = MockState {
                invocation_count: index + 1,
                extra: state.extra,
            };
            let body = serde_json::to_value(&next)
                .map_err(|e| HarnessError::Serialization(e.to_string()))?;
            let item = StateItem::new(session.test_id.as_str(), key.as_str(), body);
            if self.store.put_if_version(item, version)? {
                append_run_log(
                    "info",
                    "mock.response.served",
                    json!({
                        "test_id": session.test_id,
                        "mock_id": self.mock_id,
                        "index": index,
                        "attempt": attempt,
                    }),
                );
                return Ok(exchange);
            }
            append_run_log(
                "warn",
                "mock.state.conflict",
                json!({
                    "test_id": session.test_id,
                    "mock_id": self.mock_id,
                    "index": index,
                    "attempt": attempt,
                }),
            );
        }

        Err(HarnessError::StoreConflict {
            pk: session.test_id,
            sk: key,
            attempts: self.max_conflict_retries,
        })
    }
}

/// Why `request` fails to match `matcher`, if it does. Every field present in
/// `matcher` must be present and equal in `request`, recursively through
/// objects; anything else compares by equality.
fn subset_mismatch(matcher: &Value, request: &Value, path: &str) -> Option<String> {
    match (matcher, request) {
        (Value::Object(expected), Value::Object(actual)) => {
            expected.iter().find_map(|(field, expected_value)| {
                let child = format!("{path}.{field}");
                match actual.get(field) {
                    None => Some(format!("{child}: missing")),
                    Some(actual_value) => subset_mismatch(expected_value, actual_value, &child),
                }
            })
        }
        _ if matcher == request => None,
        _ => Some(format!("{path}: expected {matcher}, got {request}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{mock_script, subset_mismatch, MockReplayClient};
    use crate::errors::HarnessError;
    use crate::runtime::FakeClock;
    use crate::session::SessionController;
    use crate::store::{MemoryStateStore, StateItem, StateStore, StoreResult};

    fn session_with(inputs: Value) -> Arc<dyn StateStore> {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        SessionController::new(Arc::clone(&store), Arc::new(FakeClock::default()))
            .start_session("T1", inputs)
            .expect("start");
        store
    }

    fn credit_script() -> Value {
        json!({"mocks": {"credit": [
            {"response": {"rating": "Good"}},
            {"response": {"rating": "Bad"}}
        ]}})
    }

    #[test]
    fn replays_script_in_order_then_fails_loudly() {
        let store = session_with(credit_script());
        let client = MockReplayClient::new(Arc::clone(&store), "credit");

        assert_eq!(client.next_response().expect("first"), json!({"rating": "Good"}));
        assert_eq!(client.next_response().expect("second"), json!({"rating": "Bad"}));
        match client.next_response() {
            Err(HarnessError::ScriptExhausted {
                mock_id,
                invocation_count,
                script_len,
            }) => {
                assert_eq!(mock_id, "credit");
                assert_eq!(invocation_count, 2);
                assert_eq!(script_len, 2);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn unscripted_mock_is_reported() {
        let store = session_with(credit_script());
        let client = MockReplayClient::new(store, "payments");
        assert!(matches!(
            client.next_response(),
            Err(HarnessError::UnconfiguredMock { mock_id }) if mock_id == "payments"
        ));
    }

    #[test]
    fn null_script_counts_as_unconfigured() {
        let inputs = json!({"mocks": {"credit": null}});
        assert!(matches!(
            mock_script(&inputs, "credit"),
            Err(HarnessError::UnconfiguredMock { mock_id }) if mock_id == "credit"
        ));
    }

    #[test]
    fn no_session_means_no_response() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let client = MockReplayClient::new(store, "credit");
        assert!(matches!(
            client.next_response(),
            Err(HarnessError::SessionNotFound)
        ));
    }

    #[test]
    fn cursor_is_per_mock_and_shared_between_clients() {
        let store = session_with(json!({"mocks": {
            "credit": [{"response": 1}, {"response": 2}],
            "fraud": [{"response": "clean"}]
        }}));
        let first = MockReplayClient::new(Arc::clone(&store), "credit");
        let second = MockReplayClient::new(Arc::clone(&store), "credit");
        let fraud = MockReplayClient::new(Arc::clone(&store), "fraud");

        assert_eq!(first.next_response().expect("1"), json!(1));
        assert_eq!(fraud.next_response().expect("fraud"), json!("clean"));
        assert_eq!(second.next_response().expect("2"), json!(2));
    }

    #[test]
    fn extra_state_fields_survive_advancing() {
        let store = session_with(credit_script());
        store
            .put(StateItem::new(
                "T1",
                "MockState-credit",
                json!({"invocationCount": 1, "note": "seeded"}),
            ))
            .expect("seed");
        let client = MockReplayClient::new(Arc::clone(&store), "credit");
        assert_eq!(client.next_response().expect("second"), json!({"rating": "Bad"}));

        let state = store
            .get("T1", "MockState-credit")
            .expect("get")
            .expect("present");
        assert_eq!(state.body["invocationCount"], json!(2));
        assert_eq!(state.body["note"], json!("seeded"));
    }

    #[test]
    fn matcher_mismatch_does_not_consume_the_exchange() {
        let store = session_with(json!({"mocks": {"credit": [
            {"response": "ok", "requestMatcher": {"customer": {"id": "c-1"}}}
        ]}}));
        let client = MockReplayClient::new(store, "credit");

        let err = client
            .next_response_for(&json!({"customer": {"id": "c-2"}}))
            .expect_err("mismatch");
        assert!(matches!(err, HarnessError::MockRequestMismatch { index: 0, .. }));

        let ok = client
            .next_response_for(&json!({"customer": {"id": "c-1", "tier": 3}}))
            .expect("match");
        assert_eq!(ok, json!("ok"));
    }

    #[test]
    fn subset_match_reports_the_offending_path() {
        let reason = subset_mismatch(&json!({"a": {"b": 1}}), &json!({"a": {}}), "$");
        assert_eq!(reason.as_deref(), Some("$.a.b: missing"));
        assert!(subset_mismatch(&json!([1, 2]), &json!([1, 2]), "$").is_none());
        assert!(subset_mismatch(&json!({"a": 1}), &json!("a"), "$").is_some());
    }

    #[test]
    fn malformed_script_is_a_serialization_error() {
        let inputs = json!({"mocks": {"credit": {"response": "not a list"}}});
        assert!(matches!(
            mock_script(&inputs, "credit"),
            Err(HarnessError::Serialization(_))
        ));
    }

    /// Fails the first `n` conditional writes, like a racing invocation would.
    struct ContendedStore {
        inner: MemoryStateStore,
        failures_left: std::sync::Mutex<u32>,
    }

    impl StateStore for ContendedStore {
        fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<StateItem>> {
            self.inner.get(pk, sk)
        }

        fn put(&self, item: StateItem) -> StoreResult<()> {
            self.inner.put(item)
        }

        fn put_if_version(&self, item: StateItem, expected: Option<i64>) -> StoreResult<bool> {
            let mut left = self.failures_left.lock().expect("lock");
            if item.sk.starts_with("MockState-") && *left > 0 {
                *left -= 1;
                return Ok(false);
            }
            drop(left);
            self.inner.put_if_version(item, expected)
        }

        fn query(&self, pk: &str) -> StoreResult<Vec<StateItem>> {
            self.inner.query(pk)
        }

        fn delete(&self, pk: &str, sk: &str) -> StoreResult<bool> {
            self.inner.delete(pk, sk)
        }
    }

    #[test]
    fn conflicts_are_retried_then_surface() {
        let contended = |failures: u32| -> Arc<dyn StateStore> {
            let store: Arc<dyn StateStore> = Arc::new(ContendedStore {
                inner: MemoryStateStore::new(),
                failures_left: std::sync::Mutex::new(failures),
            });
            SessionController::new(Arc::clone(&store), Arc::new(FakeClock::default()))
                .start_session("T1", credit_script())
                .expect("start");
            store
        };

        let client = MockReplayClient::new(contended(2), "credit").with_max_conflict_retries(3);
        assert_eq!(client.next_response().expect("retried"), json!({"rating": "Good"}));

        let client = MockReplayClient::new(contended(5), "credit").with_max_conflict_retries(3);
        assert!(matches!(
            client.next_response(),
            Err(HarnessError::StoreConflict { attempts: 3, .. })
        ));
    }
}
