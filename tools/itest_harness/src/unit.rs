//! Glue for code running inside a unit under test: find the current session,
//! record outputs against it, and answer as a mock.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::UnitEnvironment;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::mock::MockReplayClient;
use crate::recorder::{OutputRecorder, TestOutput};
use crate::runtime::Clock;
use crate::session::{current_session, TestSession};
use crate::store::{SqliteStateStore, StateStore};

pub struct UnitContext {
    store: Arc<dyn StateStore>,
    recorder: OutputRecorder,
    unit_name: String,
    mock_id: Option<String>,
}

impl UnitContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        unit_name: impl Into<String>,
        mock_id: Option<String>,
    ) -> Self {
        Self {
            recorder: OutputRecorder::new(Arc::clone(&store), clock),
            store,
            unit_name: unit_name.into(),
            mock_id,
        }
    }

    /// Open the shared store named by the unit's environment.
    pub fn from_env(
        env: &UnitEnvironment,
        clock: Arc<dyn Clock>,
        default_name: &str,
    ) -> Result<Self, HarnessError> {
        let store = SqliteStateStore::open(&env.store_path)?;
        let unit_name = env
            .unit_name
            .clone()
            .unwrap_or_else(|| default_name.to_string());
        append_run_log(
            "debug",
            "unit.context.opened",
            json!({
                "unit": unit_name,
                "store_path": env.store_path.display().to_string(),
                "mock_id": env.mock_id,
            }),
        );
        Ok(Self::new(Arc::new(store), clock, unit_name, env.mock_id.clone()))
    }

    pub fn session(&self) -> Result<TestSession, HarnessError> {
        current_session(self.store.as_ref())
    }

    /// Replay client for this unit's mock identity.
    pub fn mock(&self) -> Result<MockReplayClient, HarnessError> {
        let Some(mock_id) = self.mock_id.clone() else {
            append_run_log(
                "error",
                "unit.mock.unidentified",
                json!({ "unit": self.unit_name }),
            );
            return Err(HarnessError::Precondition(format!(
                "unit `{}` has no mock identity configured",
                self.unit_name
            )));
        };
        Ok(MockReplayClient::new(Arc::clone(&self.store), mock_id))
    }

    pub fn record(&self, payload: Value) -> Result<TestOutput, HarnessError> {
        self.recorder.record_current(payload)
    }
}

/// Run `handler` on `input` and record its result as an output of the
/// current session. Handler errors are returned unrecorded.
pub fn run_unit<F>(ctx: &UnitContext, input: Value, handler: F) -> Result<Value, HarnessError>
where
    F: FnOnce(&UnitContext, Value) -> Result<Value, HarnessError>,
{
    append_run_log("debug", "unit.run.started", json!({ "unit": ctx.unit_name }));
    let result = match handler(ctx, input) {
        Ok(result) => result,
        Err(error) => {
            append_run_log(
                "warn",
                "unit.run.failed",
                json!({ "unit": ctx.unit_name, "error": error.to_string() }),
            );
            return Err(error);
        }
    };
    ctx.record(json!({ "unit": ctx.unit_name, "result": result }))?;
    Ok(result)
}

/// Record an event that a unit consumed from `source` (a queue, a topic, a
/// bucket notification) so the driver can observe it.
pub fn capture_event(
    ctx: &UnitContext,
    source: &str,
    event: Value,
) -> Result<TestOutput, HarnessError> {
    append_run_log(
        "debug",
        "unit.event.captured",
        json!({ "unit": ctx.unit_name, "source": source }),
    );
    ctx.record(json!({ "unit": ctx.unit_name, "source": source, "event": event }))
}
