use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use foreman_core::{CoreError, SqliteStore};
use foreman_dispatch::{
    AgentProcessRunner, DispatchLimits, Dispatcher, DispatcherConfig, HttpControlApi,
    ProcessCommandRunner, StoreSideChannel, WorkspaceManager,
};

const ENV_HOME: &str = "FOREMAN_HOME";
const ENV_ENVIRONMENT: &str = "FOREMAN_ENV";
const ENV_API_BASE_URL: &str = "FOREMAN_API_BASE_URL";
const ENV_MAX_JOBS: &str = "FOREMAN_MAX_JOBS";
const ENV_AGENT_BIN: &str = "FOREMAN_AGENT_BIN";
const ENV_WORKSPACE_ROOT: &str = "FOREMAN_WORKSPACE_ROOT";
const ENV_MODEL: &str = "FOREMAN_MODEL";

const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_AGENT_BIN: &str = "claude";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_GIT_BINARY: &str = "git";

#[derive(Debug, Clone)]
struct AppConfig {
    home: PathBuf,
    environment: String,
    api_base_url: String,
    agent_binary: PathBuf,
    workspace_root: PathBuf,
    model: String,
    max_jobs: Option<usize>,
}

impl AppConfig {
    fn from_env() -> Result<Self, CoreError> {
        let home = match optional_env(ENV_HOME) {
            Some(home) => PathBuf::from(home),
            None => {
                let user_home = optional_env("HOME").ok_or_else(|| {
                    CoreError::Configuration(format!(
                        "Neither {ENV_HOME} nor HOME is set. Export {ENV_HOME} to choose a state directory."
                    ))
                })?;
                PathBuf::from(user_home).join(".foreman")
            }
        };
        let environment =
            optional_env(ENV_ENVIRONMENT).unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned());
        let workspace_root = optional_env(ENV_WORKSPACE_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("projects"));
        let max_jobs = optional_env(ENV_MAX_JOBS)
            .map(|raw| parse_max_jobs(&raw))
            .transpose()?;

        Ok(Self {
            home,
            environment,
            api_base_url: optional_env(ENV_API_BASE_URL)
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned()),
            agent_binary: PathBuf::from(
                optional_env(ENV_AGENT_BIN).unwrap_or_else(|| DEFAULT_AGENT_BIN.to_owned()),
            ),
            workspace_root,
            model: optional_env(ENV_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            max_jobs,
        })
    }

    fn store_path(&self) -> PathBuf {
        self.home.join(format!("foreman-{}.db", self.environment))
    }

    fn sessions_root(&self) -> PathBuf {
        self.home.join("sessions")
    }

    fn log_path(&self) -> PathBuf {
        self.home.join("foreman.log")
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_max_jobs(raw: &str) -> Result<usize, CoreError> {
    let parsed: usize = raw.parse().map_err(|_| {
        CoreError::Configuration(format!(
            "{ENV_MAX_JOBS} must be a positive integer, got '{raw}'."
        ))
    })?;
    if parsed == 0 {
        return Err(CoreError::Configuration(format!(
            "{ENV_MAX_JOBS} must be greater than zero."
        )));
    }
    Ok(parsed)
}

fn init_file_logging(log_path: &std::path::Path) -> Result<(), CoreError> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| {
            CoreError::Configuration(format!(
                "failed to open foreman log file '{}': {error}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

/// One dispatch cycle per invocation: an external scheduler re-invokes this
/// binary every few minutes, and all state lives in the store.
#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    std::fs::create_dir_all(&config.home).map_err(|error| {
        CoreError::Configuration(format!(
            "failed to create foreman home directory '{}': {error}",
            config.home.display()
        ))
    })?;
    init_file_logging(&config.log_path())?;

    let store = SqliteStore::open(config.store_path())?;
    let store = Arc::new(Mutex::new(store));

    let workspace = Arc::new(WorkspaceManager::new(
        ProcessCommandRunner,
        PathBuf::from(DEFAULT_GIT_BINARY),
        config.workspace_root.clone(),
    ));
    let runner = Arc::new(AgentProcessRunner::default());
    let side_channel = Arc::new(StoreSideChannel::new(Arc::clone(&store)));
    let api = Arc::new(HttpControlApi::new(config.api_base_url.clone()));

    let mut limits = DispatchLimits::default();
    if let Some(max_jobs) = config.max_jobs {
        limits.max_jobs = max_jobs;
    }

    let dispatcher = Dispatcher::new(
        store,
        workspace,
        runner,
        side_channel,
        api,
        DispatcherConfig {
            agent_binary: config.agent_binary.clone(),
            model: config.model.clone(),
            sessions_root: config.sessions_root(),
            limits,
        },
    );

    let report = dispatcher.run_cycle(Utc::now()).await?;
    tracing::info!(
        outcome = ?report.outcome,
        dispatched = report.dispatched,
        completed = report.completed,
        skipped = report.skipped,
        mentions_dispatched = report.mentions.dispatched,
        "dispatch cycle finished"
    );
    println!(
        "foreman: {:?} dispatched={} completed={} skipped={} mentions={}",
        report.outcome,
        report.dispatched,
        report.completed,
        report.skipped,
        report.mentions.dispatched
    );

    Ok(())
}
