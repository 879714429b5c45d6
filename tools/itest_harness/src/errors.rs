use std::time::Duration;

use thiserror::Error;

use crate::recorder::TestOutput;

/// Partial result handed back when `poll_outputs` gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTimeout {
    pub test_id: String,
    pub elapsed: Duration,
    pub outputs: Vec<TestOutput>,
}

impl PollTimeout {
    /// True when nothing at all was recorded before the deadline. A negative
    /// assertion ("this unit must not emit anything") treats this as success.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("no current test session")]
    SessionNotFound,
    #[error("store integrity violation: {0}")]
    Integrity(String),
    #[error("mock `{mock_id}` has no scripted exchanges in the current session")]
    UnconfiguredMock { mock_id: String },
    #[error("mock `{mock_id}` script exhausted: call {invocation_count} but only {script_len} exchanges scripted")]
    ScriptExhausted {
        mock_id: String,
        invocation_count: u64,
        script_len: usize,
    },
    #[error("mock `{mock_id}` exchange {index} does not match request: {reason}")]
    MockRequestMismatch {
        mock_id: String,
        index: u64,
        reason: String,
    },
    #[error("store conflict on {pk}/{sk} after {attempts} attempts")]
    StoreConflict {
        pk: String,
        sk: String,
        attempts: u32,
    },
    #[error(
        "timed out after {}ms waiting on outputs for `{}` ({} recorded)",
        .0.elapsed.as_millis(),
        .0.test_id,
        .0.outputs.len()
    )]
    Timeout(PollTimeout),
    #[error("unit `{unit}` failed: {payload}")]
    RemoteInvocation { unit: String, payload: String },
}
