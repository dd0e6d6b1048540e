//! Configuration types.
//!
//! Everything is read from the environment (optionally seeded from a `.env`
//! file by the binary). Unset variables fall back to defaults; set but
//! unparseable values are errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default system prompt for the chat executor.
pub const DEFAULT_INSTRUCTION: &str = "You are a background web automation agent. \
Execute the steps provided faithfully. \
If a step fails, report the error.";

/// Which executor implementation backs new jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Chat,
    DryRun,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "llm" => Ok(Self::Chat),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            other => Err(format!("unknown executor '{other}' (expected chat or dry-run)")),
        }
    }
}

/// Retry policy applied by the chat executor to individual HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exp_base: u32,
    /// HTTP statuses considered transient.
    pub retry_statuses: Vec<u16>,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.exp_base.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exp_base: 2,
            retry_statuses: vec![429, 500, 503],
        }
    }
}

/// Tool server launched for each chat job (an MCP server over stdio).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolServerConfig {
    /// Program to run.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Limit on spawning and the initialize handshake.
    pub startup_timeout: Duration,
    /// Limit on a single tool call.
    pub call_timeout: Duration,
}

impl ToolServerConfig {
    /// Parse a whitespace-separated command line. `none`/`off` disables tools.
    pub fn parse_command_line(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let command = parts.next()?;
        if matches!(command.to_ascii_lowercase().as_str(), "none" | "off") {
            return None;
        }
        Some(Self {
            command,
            args: parts.collect(),
            ..Self::default()
        })
    }

    /// The full command line, for display.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for ToolServerConfig {
    /// Playwright browser automation server.
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["@playwright/mcp@latest".to_string()],
            startup_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Chat executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<SecretString>,
    pub temperature: f32,
    pub instruction: String,
    /// Timeout for a single HTTP request made by the executor.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Browser tool server, `None` for plain chat.
    pub tools: Option<ToolServerConfig>,
    /// Model round trips allowed per step while it keeps calling tools.
    pub max_tool_rounds: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Chat,
            model: "gpt-4o".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: 0.01,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            tools: Some(ToolServerConfig::default()),
            max_tool_rounds: 25,
        }
    }
}

/// Diagnostic logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            file_prefix: "agent-jobs.log".to_string(),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, Default)]
pub struct JobsConfig {
    pub executor: ExecutorConfig,
    /// Optional JSON file with additional workflows.
    pub workflows_file: Option<PathBuf>,
    pub logging: LoggingConfig,
}

impl JobsConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        let exec = &mut config.executor;

        if let Some(kind) = get("AGENT_JOBS_EXECUTOR") {
            exec.kind = kind.parse().map_err(|message| ConfigError::InvalidValue {
                key: "AGENT_JOBS_EXECUTOR".to_string(),
                message,
            })?;
        }
        if let Some(model) = get("AGENT_JOBS_MODEL") {
            exec.model = model;
        }
        if let Some(base) = get("AGENT_JOBS_API_BASE") {
            exec.api_base = base.trim_end_matches('/').to_string();
        }
        exec.api_key = get("OPENAI_API_KEY").map(SecretString::from);
        if let Some(instruction) = get("AGENT_JOBS_INSTRUCTION") {
            exec.instruction = instruction;
        }
        if let Some(t) = parse_var::<f32>(&get, "AGENT_JOBS_TEMPERATURE")? {
            exec.temperature = t;
        }
        if let Some(secs) = parse_var::<u64>(&get, "AGENT_JOBS_REQUEST_TIMEOUT_SECS")? {
            exec.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&get, "AGENT_JOBS_MAX_RETRIES")? {
            exec.retry.max_retries = n;
        }
        if let Some(line) = get("AGENT_JOBS_TOOL_SERVER") {
            exec.tools = ToolServerConfig::parse_command_line(&line);
        }
        if let Some(tools) = exec.tools.as_mut()
            && let Some(secs) = parse_var::<u64>(&get, "AGENT_JOBS_TOOL_TIMEOUT_SECS")?
        {
            tools.call_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&get, "AGENT_JOBS_MAX_TOOL_ROUNDS")? {
            exec.max_tool_rounds = n;
        }

        config.workflows_file = get("AGENT_JOBS_WORKFLOWS").map(PathBuf::from);
        if let Some(dir) = get("AGENT_JOBS_LOG_DIR") {
            config.logging.dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}
