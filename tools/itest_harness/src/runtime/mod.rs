use crate::errors::HarnessError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError>;
}

/// Milliseconds since the unix epoch for `clock`, saturating at zero.
pub fn unix_millis(clock: &dyn Clock) -> u64 {
    clock
        .now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub trait ProcessRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr.
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, HarnessError>;
    /// Start the process with all stdio detached and return its pid. The
    /// child is not tracked and keeps running after the caller exits.
    fn spawn_detached(&self, request: ProcessRequest) -> Result<u32, HarnessError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), HarnessError>;
    fn write_error(&self, line: &str) -> Result<(), HarnessError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Io(format!("{}: {e}", path.display())))
    }
}

pub struct ProductionProcessRunner;

fn command_for(request: &ProcessRequest) -> std::process::Command {
    let mut cmd = std::process::Command::new(&request.program);
    cmd.args(&request.args).stdin(std::process::Stdio::null());
    if let Some(cwd) = &request.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    cmd
}

impl ProcessRunner for ProductionProcessRunner {
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, HarnessError> {
        let output = command_for(&request)
            .output()
            .map_err(|e| HarnessError::Process(format!("{}: {e}", request.program)))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn spawn_detached(&self, request: ProcessRequest) -> Result<u32, HarnessError> {
        let mut child = command_for(&request)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| HarnessError::Process(format!("{}: {e}", request.program)))?;
        let pid = child.id();
        // Reaped here; callers never wait on a detached child.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), HarnessError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| HarnessError::Io(e.to_string()))
    }

    fn write_error(&self, line: &str) -> Result<(), HarnessError> {
        use std::io::Write;
        let mut err = std::io::stderr();
        writeln!(err, "{line}").map_err(|e| HarnessError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Manually driven clock. `sleep_until` jumps straight to the deadline.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), HarnessError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| HarnessError::Io(format!("missing file {}", path.display())))
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), HarnessError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_error(&self, line: &str) -> Result<(), HarnessError> {
        self.errors
            .lock()
            .expect("errors lock")
            .push(line.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, HarnessError>>>>,
    runs: Arc<Mutex<Vec<ProcessRequest>>>,
    detached: Arc<Mutex<Vec<ProcessRequest>>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, HarnessError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    pub fn runs(&self) -> Vec<ProcessRequest> {
        self.runs.lock().expect("runs lock").clone()
    }

    pub fn detached(&self) -> Vec<ProcessRequest> {
        self.detached.lock().expect("detached lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, HarnessError> {
        self.runs.lock().expect("runs lock").push(request);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(HarnessError::Process(
                "no fake response queued".to_string(),
            ));
        }
        responses.remove(0)
    }

    fn spawn_detached(&self, request: ProcessRequest) -> Result<u32, HarnessError> {
        let mut detached = self.detached.lock().expect("detached lock");
        detached.push(request);
        Ok(10_000 + detached.len() as u32)
    }
}
