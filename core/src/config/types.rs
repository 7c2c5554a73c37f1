use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub realise: RealiseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or OS temp dir if unset).
    #[serde(default)]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "nixtask_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Optional directory for log files. If empty or unset, uses OS temp dir.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: false,
            level: default_logging_level(),
            directory: None,
        }
    }
}

/// The long-lived evaluator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_evaluator_program")]
    pub program: String,

    #[serde(default = "default_evaluator_args")]
    pub args: Vec<String>,

    /// Text the evaluator prints on stderr once it accepts commands. Empty disables the wait.
    #[serde(default = "default_startup_marker")]
    pub startup_marker: String,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Expression library loaded before task collection.
    #[serde(default)]
    pub lib_path: Option<String>,

    #[serde(default = "default_request_queue_capacity")]
    pub request_queue_capacity: usize,
}

fn default_evaluator_program() -> String {
    "nix".to_string()
}

fn default_evaluator_args() -> Vec<String> {
    vec!["repl".to_string()]
}

fn default_startup_marker() -> String {
    "Type :? for help".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_request_queue_capacity() -> usize {
    100
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: default_evaluator_program(),
            args: default_evaluator_args(),
            startup_marker: default_startup_marker(),
            startup_timeout_ms: default_startup_timeout_ms(),
            lib_path: None,
            request_queue_capacity: default_request_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of tasks executing at once. 1 means strictly sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Idle window between aggregated output flushes when running concurrently.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// How long a background command gets after SIGTERM before it is killed.
    #[serde(default = "default_background_grace_ms")]
    pub background_grace_ms: u64,

    /// How long to keep reading the control channel after the task process exits.
    #[serde(default = "default_control_drain_ms")]
    pub control_drain_ms: u64,

    #[serde(default = "default_line_channel_capacity")]
    pub line_channel_capacity: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_background_grace_ms() -> u64 {
    2_000
}

fn default_control_drain_ms() -> u64 {
    200
}

fn default_line_channel_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            flush_interval_ms: default_flush_interval_ms(),
            background_grace_ms: default_background_grace_ms(),
            control_drain_ms: default_control_drain_ms(),
            line_channel_capacity: default_line_channel_capacity(),
        }
    }
}

/// Tooling used to build each task's isolated environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// State directory, relative to the working directory of the run.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_bash")]
    pub bash: String,

    #[serde(default = "default_jq")]
    pub jq: String,

    /// Client for the task control socket.
    #[serde(default = "default_curl")]
    pub curl: String,

    /// Prefix whose `bin` directory is always on the task PATH.
    #[serde(default)]
    pub coreutils: Option<String>,

    #[serde(default)]
    pub util_linux: Option<String>,

    /// Run tasks inside a user+mount namespace (Linux only).
    #[serde(default)]
    pub task_user_namespaces: bool,
}

fn default_state_dir() -> String {
    ".nix-task".to_string()
}

fn default_bash() -> String {
    "bash".to_string()
}

fn default_jq() -> String {
    "jq".to_string()
}

fn default_curl() -> String {
    "curl".to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bash: default_bash(),
            jq: default_jq(),
            curl: default_curl(),
            coreutils: None,
            util_linux: None,
            task_user_namespaces: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealiseConfig {
    #[serde(default = "default_realise_program")]
    pub program: String,
}

fn default_realise_program() -> String {
    "nix-store".to_string()
}

impl Default for RealiseConfig {
    fn default() -> Self {
        Self {
            program: default_realise_program(),
        }
    }
}
