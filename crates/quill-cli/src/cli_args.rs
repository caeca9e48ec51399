use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use quill_runtime::QuillServiceConfig;

const DEFAULT_FETCH_CRON: &str = "0 5 * * * *";

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "quill",
    about = "Windowed skill result cache with single-flight execution and proactive fetching",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "QUILL_CATALOG",
        default_value = "skills.json",
        global = true,
        help = "Path to the JSON skill catalog"
    )]
    pub catalog: PathBuf,

    #[arg(
        long = "data-dir",
        env = "QUILL_DATA_DIR",
        default_value = ".quill",
        global = true,
        help = "Directory holding the bucket cache and scheduler state"
    )]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub agent: AgentArgs,

    #[command(flatten)]
    pub execution: ExecutionArgs,

    #[command(subcommand)]
    pub command: QuillCommand,
}

#[derive(Debug, Args)]
pub(crate) struct AgentArgs {
    #[arg(
        long = "agent-executable",
        env = "QUILL_AGENT_EXECUTABLE",
        default_value = "claude",
        global = true,
        help = "Executable spawned for agent-backed skills"
    )]
    pub agent_executable: String,

    #[arg(
        long = "agent-arg",
        env = "QUILL_AGENT_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        global = true,
        help = "Replaces the default agent arguments (comma-separated when read from env)"
    )]
    pub agent_args: Vec<String>,

    #[arg(
        long = "max-agent-sessions",
        env = "QUILL_MAX_AGENT_SESSIONS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        global = true,
        help = "Maximum number of concurrently running agent processes"
    )]
    pub max_agent_sessions: usize,

    #[arg(
        long = "agent-handshake-timeout-ms",
        env = "QUILL_AGENT_HANDSHAKE_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        global = true
    )]
    pub agent_handshake_timeout_ms: u64,

    #[arg(
        long = "agent-idle-timeout-ms",
        env = "QUILL_AGENT_IDLE_TIMEOUT_MS",
        default_value_t = 600_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Idle agent sessions older than this are terminated by the sweeper"
    )]
    pub agent_idle_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub(crate) struct ExecutionArgs {
    #[arg(
        long = "heartbeat-interval-ms",
        env = "QUILL_HEARTBEAT_INTERVAL_MS",
        default_value_t = 15_000,
        global = true,
        help = "Heartbeat event interval while a request waits; 0 disables heartbeats"
    )]
    pub heartbeat_interval_ms: u64,

    #[arg(
        long = "fetch-max-attempts",
        env = "QUILL_FETCH_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_usize,
        global = true
    )]
    pub fetch_max_attempts: usize,

    #[arg(
        long = "fetch-retry-delay-ms",
        env = "QUILL_FETCH_RETRY_DELAY_MS",
        default_value_t = 30_000,
        global = true
    )]
    pub fetch_retry_delay_ms: u64,
}

#[derive(Debug, Subcommand)]
pub(crate) enum QuillCommand {
    /// Load the cache, run a catch-up pass, then fetch on the cron schedule.
    Serve {
        #[arg(
            long,
            env = "QUILL_FETCH_CRON",
            default_value = DEFAULT_FETCH_CRON,
            help = "Six-field cron expression evaluated in the catalog timezone"
        )]
        cron: String,
    },
    /// Request one skill and print status events as NDJSON.
    Run {
        skill: String,
        #[arg(long)]
        input: Option<String>,
    },
    /// List a skill's retained buckets and whether each holds data.
    Buckets { skill: String },
    /// Drop cached buckets for one skill or for every skill.
    Clear {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        skill: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Validate the catalog and print the expanded skill list.
    Catalog,
}

impl Cli {
    pub(crate) fn service_config(&self) -> QuillServiceConfig {
        let mut config = QuillServiceConfig::new(&self.catalog, &self.data_dir);
        config.agent.executable = self.agent.agent_executable.clone();
        if !self.agent.agent_args.is_empty() {
            config.agent.args = self.agent.agent_args.clone();
        }
        config.pool.max_sessions = self.agent.max_agent_sessions;
        config.pool.handshake_timeout = Duration::from_millis(self.agent.agent_handshake_timeout_ms);
        config.pool.idle_timeout = Duration::from_millis(self.agent.agent_idle_timeout_ms);
        config.execution.heartbeat_interval =
            Duration::from_millis(self.execution.heartbeat_interval_ms);
        config.retry.max_attempts = self.execution.fetch_max_attempts;
        config.retry.retry_delay = Duration::from_millis(self.execution.fetch_retry_delay_ms);
        config
    }
}
