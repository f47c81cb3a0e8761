//! Configuration types.
//!
//! Plain structs with defaults for library use, plus clap argument structs
//! that read flags with environment fallbacks for the binary.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Args;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Runner (worker) configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Identity reported to the coordinator when asking for work.
    pub runner_id: String,
    /// Coordinator base URL, e.g. `http://1.2.3.4:8080`.
    pub api_host: String,
    pub api_token: SecretString,
    /// Declared memory capacity shared by all execution contexts.
    pub memory_bytes: u64,
    pub labels: BTreeMap<String, String>,
    /// Idle time after which an execution context is destroyed.
    pub idle_timeout: Duration,
    /// Delay between requests for the next task.
    pub poll_interval: Duration,
    /// Delay between state reports.
    pub report_interval: Duration,
    /// How often idle contexts are checked for eviction.
    pub eviction_interval: Duration,
    pub server_host: String,
    pub server_port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: String::new(),
            api_host: String::new(),
            api_token: SecretString::from(String::new()),
            memory_bytes: 0,
            labels: BTreeMap::new(),
            idle_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            report_interval: Duration::from_secs(1),
            eviction_interval: Duration::from_secs(1),
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host: String,
    pub port: u16,
    /// Token runners must present; `None` accepts any runner.
    pub runner_token: Option<SecretString>,
    /// How long a requester waits for a runner's reply.
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            runner_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ── Command line ────────────────────────────────────────────────────────

/// Runner flags. Every flag falls back to an environment variable.
#[derive(Debug, Clone, Args)]
pub struct RunnerArgs {
    /// The ID of this runner to report to the api server when asking for jobs
    #[arg(long, env = "RUNNER_ID", default_value = "")]
    pub runner_id: String,

    /// The base URL of the api - e.g. http://1.2.3.4:8080
    #[arg(long, env = "API_HOST", default_value = "")]
    pub api_host: String,

    /// The auth token for this runner
    #[arg(long, env = "API_TOKEN", default_value = "", hide_env_values = true)]
    pub api_token: String,

    /// The number of bytes of memory available - e.g. 1073741824
    #[arg(long, env = "MEMORY_BYTES", default_value_t = 0)]
    pub memory_bytes: u64,

    /// Short notation for the amount of memory available - e.g. 1GB
    #[arg(long = "memory", env = "MEMORY_STRING")]
    pub memory_string: Option<String>,

    /// Labels to attach to this runner, as key=value (repeatable or comma separated)
    #[arg(long = "label", env = "LABELS", value_delimiter = ',')]
    pub labels: Vec<String>,

    /// How many seconds without a task before an execution context is shut down
    #[arg(long, env = "TIMEOUT_SECONDS", default_value_t = 10)]
    pub timeout_seconds: u64,

    /// How many milliseconds to wait between requests for the next task
    #[arg(long, env = "GET_TASK_DELAY_MILLISECONDS", default_value_t = 100)]
    pub get_task_delay_milliseconds: u64,

    /// How many seconds to wait between reporting state to the api
    #[arg(long, env = "REPORT_STATE_DELAY_SECONDS", default_value_t = 1)]
    pub report_state_delay_seconds: u64,

    /// The host to bind the runner server to
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub server_host: String,

    /// The port to bind the runner server to
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub server_port: u16,

    /// Program that executes tasks; receives the payload on stdin
    #[arg(long, env = "EXECUTOR_COMMAND", default_value = "gptscript")]
    pub executor_command: String,

    /// Arguments passed to the executor program
    #[arg(long, env = "EXECUTOR_ARGS", value_delimiter = ' ')]
    pub executor_args: Vec<String>,

    /// Seconds a single task may run before it is killed
    #[arg(long, env = "EXECUTOR_TIMEOUT_SECONDS", default_value_t = 300)]
    pub executor_timeout_seconds: u64,
}

impl RunnerArgs {
    /// Validate flags and build a [`RunnerConfig`].
    pub fn to_config(&self) -> Result<RunnerConfig, ConfigError> {
        if self.runner_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "runner-id".to_string(),
                hint: "Set --runner-id or RUNNER_ID".to_string(),
            });
        }
        if self.api_host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "api-host".to_string(),
                hint: "Set --api-host or API_HOST".to_string(),
            });
        }

        let memory_bytes = match self.memory_string.as_deref() {
            Some(s) if !s.trim().is_empty() => parse_memory_size(s)?,
            _ => self.memory_bytes,
        };
        if memory_bytes == 0 {
            return Err(ConfigError::MissingRequired {
                key: "memory".to_string(),
                hint: "Set --memory (e.g. 24GB) or --memory-bytes".to_string(),
            });
        }
        if self.get_task_delay_milliseconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "get-task-delay-milliseconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.report_state_delay_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "report-state-delay-seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let idle_timeout = Duration::from_secs(self.timeout_seconds);

        Ok(RunnerConfig {
            runner_id: self.runner_id.trim().to_string(),
            api_host: self.api_host.trim_end_matches('/').to_string(),
            api_token: SecretString::from(self.api_token.clone()),
            memory_bytes,
            labels: parse_labels(&self.labels)?,
            idle_timeout,
            poll_interval: Duration::from_millis(self.get_task_delay_milliseconds),
            report_interval: Duration::from_secs(self.report_state_delay_seconds),
            eviction_interval: idle_timeout.min(Duration::from_secs(1)).max(Duration::from_millis(100)),
            server_host: self.server_host.clone(),
            server_port: self.server_port,
        })
    }
}

/// Coordinator flags.
#[derive(Debug, Clone, Args)]
pub struct CoordinatorArgs {
    /// The host to bind the coordinator to
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// The port to bind the coordinator to
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Token runners must present when connecting
    #[arg(long, env = "RUNNER_TOKEN", hide_env_values = true)]
    pub runner_token: Option<String>,

    /// Seconds a requester waits for a runner reply
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value_t = 30)]
    pub request_timeout_seconds: u64,
}

impl CoordinatorArgs {
    pub fn to_config(&self) -> Result<CoordinatorConfig, ConfigError> {
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "request-timeout-seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(CoordinatorConfig {
            host: self.host.clone(),
            port: self.port,
            runner_token: self
                .runner_token
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| SecretString::from(t.clone())),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
        })
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────

/// Parse a human-readable memory size such as `24GB`, `512MiB` or `1073741824`.
///
/// Decimal suffixes (`KB`, `MB`, `GB`, `TB`) are powers of 1000, binary
/// suffixes (`KiB`, `MiB`, `GiB`, `TiB`) powers of 1024. A bare number is
/// bytes. Fractions are allowed (`1.5GB`).
pub fn parse_memory_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidMemorySize(input.to_string());
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

/// Parse `key=value` labels into a map. Later duplicates win.
pub fn parse_labels<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut labels = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref().trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidLabel(pair.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidLabel(pair.to_string()));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}
