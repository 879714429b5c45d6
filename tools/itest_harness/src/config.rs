use crate::errors::HarnessError;
use crate::invoke::UnitAddress;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Physical location of the shared store, injected into deployed units.
pub const STORE_ENV: &str = "ITEST_STATE_STORE";
/// Mock identity of the running mock handler.
pub const MOCK_ID_ENV: &str = "ITEST_MOCK_ID";
/// Logical name a unit records its results under.
pub const UNIT_NAME_ENV: &str = "ITEST_UNIT_NAME";

pub const MAX_POLL_INTERVAL_MS: u64 = 1000;

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    pub store: StoreConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
    pub units: BTreeMap<String, UnitAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub level: String,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                path: PathBuf::from(".itest/state.sqlite"),
            },
            poll: PollConfig {
                timeout_ms: 10_000,
                interval_ms: 250,
            },
            logging: LoggingConfig {
                path: None,
                level: "info".to_string(),
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
            units: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHarnessConfig {
    store: Option<PartialStoreConfig>,
    poll: Option<PartialPollConfig>,
    logging: Option<PartialLoggingConfig>,
    units: Option<BTreeMap<String, UnitAddress>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStoreConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPollConfig {
    timeout_ms: Option<u64>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    level: Option<String>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

/// What a deployed unit learns from its environment: where the store is and,
/// for mock handlers, which mock identity it plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEnvironment {
    pub store_path: PathBuf,
    pub mock_id: Option<String>,
    pub unit_name: Option<String>,
}

impl UnitEnvironment {
    pub fn from_env(cfg: &HarnessConfig, env: &EnvMap) -> Self {
        let non_empty = |key: &str| {
            env.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            store_path: cfg.store.path.clone(),
            mock_id: non_empty(MOCK_ID_ENV),
            unit_name: non_empty(UNIT_NAME_ENV),
        }
    }
}

/// Defaults, then the TOML file, then the environment, then CLI flags.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
    env: &EnvMap,
) -> Result<HarnessConfig, HarnessError> {
    let mut cfg = HarnessConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialHarnessConfig = toml::from_str(&file_contents)
            .map_err(|e| HarnessError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_env_overrides(&mut cfg, env);
    apply_cli_overrides(&mut cfg, overrides);
    absolutize_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;

    append_run_log(
        "debug",
        "config.loaded",
        json!({
            "config_path": overrides.config_path.as_ref().map(|p| p.display().to_string()),
            "store_path": cfg.store.path.display().to_string(),
            "units": cfg.units.keys().collect::<Vec<_>>(),
        }),
    );
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut HarnessConfig, partial: PartialHarnessConfig) {
    if let Some(store) = partial.store {
        if let Some(path) = store.path {
            cfg.store.path = path;
        }
    }

    if let Some(poll) = partial.poll {
        if let Some(value) = poll.timeout_ms {
            cfg.poll.timeout_ms = value;
        }
        if let Some(value) = poll.interval_ms {
            cfg.poll.interval_ms = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(level) = logging.level {
            cfg.logging.level = level;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(units) = partial.units {
        cfg.units = units;
    }
}

fn apply_env_overrides(cfg: &mut HarnessConfig, env: &EnvMap) {
    if let Some(path) = env.get(STORE_ENV).filter(|value| !value.trim().is_empty()) {
        cfg.store.path = PathBuf::from(path.trim());
    }
}

fn apply_cli_overrides(cfg: &mut HarnessConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.store_path {
        cfg.store.path = path.clone();
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
}

fn absolutize_paths(cfg: &mut HarnessConfig, base: &Path) {
    cfg.store.path = absolutize_path(base, &cfg.store.path);
    if let Some(path) = &cfg.logging.path {
        cfg.logging.path = Some(absolutize_path(base, path));
    }
    for unit in cfg.units.values_mut() {
        if let Some(cwd) = &unit.cwd {
            unit.cwd = Some(absolutize_path(base, cwd));
        }
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &HarnessConfig) -> Result<(), HarnessError> {
    if cfg.poll.interval_ms == 0 {
        return Err(HarnessError::InvalidConfig(
            "poll.interval_ms must be greater than zero".to_string(),
        ));
    }

    if cfg.poll.interval_ms > MAX_POLL_INTERVAL_MS {
        return Err(HarnessError::InvalidConfig(format!(
            "poll.interval_ms must be at most {MAX_POLL_INTERVAL_MS}"
        )));
    }

    if cfg.poll.timeout_ms < cfg.poll.interval_ms {
        return Err(HarnessError::InvalidConfig(
            "poll.timeout_ms must be at least poll.interval_ms".to_string(),
        ));
    }

    if !["trace", "debug", "info", "warn", "error"].contains(&cfg.logging.level.as_str()) {
        return Err(HarnessError::InvalidConfig(format!(
            "logging.level `{}` is not one of trace, debug, info, warn, error",
            cfg.logging.level
        )));
    }

    for (name, unit) in &cfg.units {
        if unit.program.trim().is_empty() {
            return Err(HarnessError::InvalidConfig(format!(
                "units.{name}.program must not be empty"
            )));
        }
    }

    append_run_log(
        "debug",
        "config.validated",
        json!({ "timeout_ms": cfg.poll.timeout_ms, "interval_ms": cfg.poll.interval_ms }),
    );
    Ok(())
}
