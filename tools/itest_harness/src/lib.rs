pub mod config;
pub mod errors;
pub mod invoke;
pub mod log_retention;
pub mod logging;
pub mod mock;
pub mod recorder;
pub mod runtime;
pub mod session;
pub mod store;
pub mod unit;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{error::ErrorKind, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use config::{load_config, CliOverrides, EnvMap, HarnessConfig, UnitEnvironment, STORE_ENV};
use errors::HarnessError;
use invoke::{InvocationClient, StaticUnitResolver};
use logging::{append_run_log, init_run_logger, JsonlLogger};
use mock::MockReplayClient;
use recorder::OutputRecorder;
use runtime::ProductionRuntime;
use session::{new_test_id, PollOptions, SessionController};
use store::{SqliteStateStore, StateStore};

/// Exit code for a poll that ran out of time. Partial outputs are still printed.
pub const EXIT_POLL_TIMEOUT: i32 = 2;

#[derive(Debug, Clone, Parser)]
#[command(name = "itest_harness")]
#[command(about = "Coordinate integration test sessions, recorded outputs and scripted mocks")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Path of the shared state store; overrides config and ITEST_STATE_STORE.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Begin a session and make it current.
    Start {
        #[arg(long)]
        test_id: Option<String>,
        #[arg(long, conflicts_with = "inputs_file")]
        inputs: Option<String>,
        #[arg(long)]
        inputs_file: Option<PathBuf>,
    },
    /// Print the current session.
    Current,
    /// Wait until a session has at least `min_count` outputs.
    Poll {
        #[arg(long)]
        test_id: String,
        #[arg(long)]
        min_count: usize,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Record an output, against the current session unless `--test-id` is given.
    Record {
        #[arg(long)]
        test_id: Option<String>,
        #[arg(long)]
        payload: String,
    },
    /// Serve the next scripted response for a mock.
    NextResponse {
        #[arg(long)]
        mock_id: Option<String>,
        #[arg(long)]
        request: Option<String>,
    },
    /// Print a mock's replay cursor.
    MockState {
        #[arg(long)]
        test_id: String,
        #[arg(long)]
        mock_id: String,
    },
    /// Invoke a configured unit with a JSON request.
    Invoke {
        #[arg(long)]
        unit: String,
        #[arg(long)]
        request: String,
        #[arg(long = "async", default_value_t = false)]
        fire_and_forget: bool,
    },
    /// Clear the current-session pointer if it names this session.
    End {
        #[arg(long)]
        test_id: String,
    },
    /// Print every output recorded for a session.
    Outputs {
        #[arg(long)]
        test_id: String,
    },
}

/// Process entry point: returns the exit code after reporting any failure.
pub fn run() -> i32 {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    let result = std::env::current_dir()
        .map_err(|e| HarnessError::Io(e.to_string()))
        .and_then(|cwd| run_with_runtime(&args, &env, &cwd, &runtime));
    exit_code(result, &runtime)
}

fn exit_code(result: Result<i32, HarnessError>, runtime: &ProductionRuntime) -> i32 {
    match result {
        Ok(code) => code,
        Err(error) => {
            append_run_log(
                "error",
                "cli.command.failed",
                json!({ "error": error.to_string() }),
            );
            let _ = runtime.terminal.write_error(&error.to_string());
            1
        }
    }
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, HarnessError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(HarnessError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        store_path: cli.store.clone(),
        log_path: cli.log_file.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref(), &env_map)?;
    init_run_logger(run_logger(&cfg));
    append_run_log(
        "info",
        "cli.command.started",
        json!({
            "command": command_name(&cli.command),
            "store": cfg.store.path.display().to_string(),
        }),
    );

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&cfg.store.path)?);
    let controller = SessionController::new(Arc::clone(&store), Arc::clone(&runtime.clock));

    let code = match cli.command {
        Command::Start {
            test_id,
            inputs,
            inputs_file,
        } => {
            let inputs = match (inputs, inputs_file) {
                (Some(raw), _) => parse_json_arg("--inputs", &raw)?,
                (None, Some(path)) => {
                    let raw = runtime.file_system.read_to_string(&cwd.join(path))?;
                    parse_json_arg("--inputs-file", &raw)?
                }
                (None, None) => json!({}),
            };
            let test_id = test_id.unwrap_or_else(|| new_test_id(runtime.clock.as_ref()));
            let session = controller.start_session(&test_id, inputs)?;
            print_json(runtime, &session)?;
            0
        }
        Command::Current => {
            let session = controller.current_session()?;
            print_json(runtime, &session)?;
            0
        }
        Command::Poll {
            test_id,
            min_count,
            timeout_ms,
            interval_ms,
        } => {
            let mut poll = cfg.poll.clone();
            if let Some(value) = timeout_ms {
                poll.timeout_ms = value;
            }
            if let Some(value) = interval_ms {
                poll.interval_ms = value;
            }
            match controller.poll_for_count(&test_id, min_count, &PollOptions::from(&poll)) {
                Ok(outputs) => {
                    print_json(
                        runtime,
                        &json!({ "testId": test_id, "timedOut": false, "outputs": outputs }),
                    )?;
                    0
                }
                Err(HarnessError::Timeout(timeout)) => {
                    print_json(
                        runtime,
                        &json!({
                            "testId": timeout.test_id,
                            "timedOut": true,
                            "elapsedMs": timeout.elapsed.as_millis() as u64,
                            "outputs": timeout.outputs,
                        }),
                    )?;
                    EXIT_POLL_TIMEOUT
                }
                Err(e) => return Err(e),
            }
        }
        Command::Record { test_id, payload } => {
            let payload = parse_json_arg("--payload", &payload)?;
            let recorder = OutputRecorder::new(Arc::clone(&store), Arc::clone(&runtime.clock));
            let output = match test_id {
                Some(test_id) => recorder.record(&test_id, payload)?,
                None => recorder.record_current(payload)?,
            };
            print_json(runtime, &output)?;
            0
        }
        Command::NextResponse { mock_id, request } => {
            let mock_id = mock_id
                .or_else(|| UnitEnvironment::from_env(&cfg, &env_map).mock_id)
                .ok_or_else(|| {
                    HarnessError::Cli("--mock-id or ITEST_MOCK_ID is required".to_string())
                })?;
            let client = MockReplayClient::new(Arc::clone(&store), mock_id);
            let response = match request {
                Some(raw) => client.next_response_for(&parse_json_arg("--request", &raw)?)?,
                None => client.next_response()?,
            };
            print_json(runtime, &response)?;
            0
        }
        Command::MockState { test_id, mock_id } => {
            let state = controller.mock_state(&test_id, &mock_id)?;
            print_json(runtime, &state)?;
            0
        }
        Command::Invoke {
            unit,
            request,
            fire_and_forget,
        } => {
            let request = parse_json_arg("--request", &request)?;
            let client = invocation_client(&cfg, runtime);
            if fire_and_forget {
                let ack = client.invoke_async(&unit, &request)?;
                print_json(runtime, &ack)?;
            } else {
                let response = client.invoke_sync(&unit, &request)?;
                print_json(runtime, &response)?;
            }
            0
        }
        Command::End { test_id } => {
            let ended = controller.end_session(&test_id)?;
            print_json(runtime, &json!({ "testId": test_id, "ended": ended }))?;
            0
        }
        Command::Outputs { test_id } => {
            let outputs = controller.list_outputs(&test_id)?;
            print_json(runtime, &outputs)?;
            0
        }
    };

    append_run_log("info", "cli.command.finished", json!({ "exit_code": code }));
    Ok(code)
}

fn invocation_client(cfg: &HarnessConfig, runtime: &ProductionRuntime) -> InvocationClient {
    InvocationClient::new(
        Arc::new(StaticUnitResolver::from_config(cfg)),
        Arc::clone(&runtime.process_runner),
    )
    .with_env(vec![(
        STORE_ENV.to_string(),
        cfg.store.path.display().to_string(),
    )])
}

fn run_logger(cfg: &HarnessConfig) -> JsonlLogger {
    let path = cfg.logging.path.clone().unwrap_or_else(|| {
        cfg.store
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("logs")
            .join("itest-harness.jsonl")
    });
    let mut logger = JsonlLogger::new(path);
    logger.min_level = cfg.logging.level.clone();
    logger.max_payload_bytes = cfg.logging.max_payload_bytes;
    logger.budget_bytes = cfg.logging.budget_bytes;
    logger
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Start { .. } => "start",
        Command::Current => "current",
        Command::Poll { .. } => "poll",
        Command::Record { .. } => "record",
        Command::NextResponse { .. } => "next-response",
        Command::MockState { .. } => "mock-state",
        Command::Invoke { .. } => "invoke",
        Command::End { .. } => "end",
        Command::Outputs { .. } => "outputs",
    }
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value, HarnessError> {
    serde_json::from_str(raw)
        .map_err(|e| HarnessError::Cli(format!("{flag} is not valid JSON: {e}")))
}

fn print_json(runtime: &ProductionRuntime, value: &impl Serialize) -> Result<(), HarnessError> {
    let line =
        serde_json::to_string(value).map_err(|e| HarnessError::Serialization(e.to_string()))?;
    runtime.terminal.write_line(&line)
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
