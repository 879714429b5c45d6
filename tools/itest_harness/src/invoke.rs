use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::HarnessConfig;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessRequest, ProcessRunner};

/// How to reach a deployed unit: a program, its fixed arguments and the
/// directory it runs in. The request JSON is appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAddress {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Maps a logical unit name to its address.
pub trait UnitResolver: Send + Sync {
    fn resolve(&self, unit: &str) -> Result<UnitAddress, HarnessError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticUnitResolver {
    units: BTreeMap<String, UnitAddress>,
}

impl StaticUnitResolver {
    pub fn new(units: BTreeMap<String, UnitAddress>) -> Self {
        Self { units }
    }

    pub fn from_config(cfg: &HarnessConfig) -> Self {
        Self::new(cfg.units.clone())
    }
}

impl UnitResolver for StaticUnitResolver {
    fn resolve(&self, unit: &str) -> Result<UnitAddress, HarnessError> {
        self.units.get(unit).cloned().ok_or_else(|| {
            HarnessError::InvalidConfig(format!("no address configured for unit `{unit}`"))
        })
    }
}

/// Acknowledgement for a fire-and-forget invocation. `handle` is the pid of
/// the detached unit process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationAck {
    pub unit: String,
    pub handle: u64,
}

pub struct InvocationClient {
    resolver: Arc<dyn UnitResolver>,
    runner: Arc<dyn ProcessRunner>,
    env: Vec<(String, String)>,
}

impl InvocationClient {
    pub fn new(resolver: Arc<dyn UnitResolver>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            resolver,
            runner,
            env: Vec::new(),
        }
    }

    /// Extra environment handed to every invoked unit, e.g. the store location.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Run the unit to completion and decode its stdout as the JSON response.
    /// A non-zero exit surfaces the unit's own error payload verbatim.
    pub fn invoke_sync(&self, unit: &str, request: &Value) -> Result<Value, HarnessError> {
        let process = self.build_request(unit, request)?;
        append_run_log(
            "info",
            "invoke.sync.started",
            json!({ "unit": unit, "program": process.program }),
        );
        let output = self.runner.run(process)?;

        if output.exit_code != 0 {
            let payload = if output.stdout.trim().is_empty() {
                output.stderr.trim().to_string()
            } else {
                output.stdout.trim().to_string()
            };
            append_run_log(
                "warn",
                "invoke.sync.remote_error",
                json!({ "unit": unit, "exit_code": output.exit_code, "payload": payload }),
            );
            return Err(HarnessError::RemoteInvocation {
                unit: unit.to_string(),
                payload,
            });
        }

        let response = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            HarnessError::Serialization(format!("unit `{unit}` returned non-JSON output: {e}"))
        })?;
        append_run_log("info", "invoke.sync.completed", json!({ "unit": unit }));
        Ok(response)
    }

    /// Start the unit detached and return without waiting for it. Its output
    /// is discarded; results reach the driver through recorded outputs.
    pub fn invoke_async(&self, unit: &str, request: &Value) -> Result<InvocationAck, HarnessError> {
        let process = self.build_request(unit, request)?;
        let handle = u64::from(self.runner.spawn_detached(process)?);
        append_run_log(
            "info",
            "invoke.async.spawned",
            json!({ "unit": unit, "handle": handle }),
        );
        Ok(InvocationAck {
            unit: unit.to_string(),
            handle,
        })
    }

    fn build_request(&self, unit: &str, request: &Value) -> Result<ProcessRequest, HarnessError> {
        let address = self.resolver.resolve(unit)?;
        let encoded =
            serde_json::to_string(request).map_err(|e| HarnessError::Serialization(e.to_string()))?;
        let mut args = address.args;
        args.push(encoded);
        Ok(ProcessRequest {
            program: address.program,
            args,
            cwd: address.cwd,
            env: self.env.clone(),
        })
    }
}
