use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `{pretty, json, compact}` tracing output, mirroring the fmt-layer choice
/// a long-running server would make, trimmed to what a CLI invocation needs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    pub root: Option<String>,
    pub jobs_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryEndpointConfig {
    pub api_base_url: Option<String>,
    pub telemetry_api: Option<String>,
    pub telemetry_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub telemetry: TelemetryEndpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            telemetry: TelemetryEndpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Layers the embedded defaults, an optional file at `MCODA_CONFIG`, and
    /// `MCODA_*` environment overrides, in that order, then applies the
    /// handful of directly-named env vars spec.md §6 calls out by name.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("MCODA_CONFIG").unwrap_or_default();

        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(&config_path).required(false))
            .add_source(Environment::with_prefix("MCODA").separator("_").try_parsing(true));

        let mut result: Config = builder
            .build()
            .context("failed to assemble configuration layers")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        apply_standard_env_vars(&mut result);
        Ok(result)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .root
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn db_path(&self) -> PathBuf {
        self.workspace
            .db_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_root().join(".mcoda").join("mcoda.db"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.workspace
            .cache_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_root().join(".mcoda").join("cache"))
    }

    pub fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            anyhow::bail!("invalid logging level: {}", self.logging.level);
        }
        Ok(())
    }
}

/// Named, directly-read overrides per spec.md §6, applied after the layered
/// config-crate pass so an exact env var always wins regardless of prefix
/// rules.
fn apply_standard_env_vars(config: &mut Config) {
    if let Ok(v) = std::env::var("MCODA_WORKSPACE") {
        config.workspace.root = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_JOBS_DIR") {
        config.workspace.jobs_dir = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_CACHE_DIR") {
        config.workspace.cache_dir = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_DB_PATH") {
        config.workspace.db_path = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_API_BASE_URL") {
        config.telemetry.api_base_url = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_TELEMETRY_API") {
        config.telemetry.telemetry_api = Some(v);
    }
    if let Ok(v) = std::env::var("MCODA_TELEMETRY_TOKEN") {
        config.telemetry.telemetry_token = Some(v);
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Forces the stub agent adapter in place of real collaborators, per
/// spec.md §6.
pub fn cli_stub_enabled() -> bool {
    env_flag("MCODA_CLI_STUB")
}

/// Skips adapter health probes before a gateway-trio run.
pub fn skip_cli_checks() -> bool {
    env_flag("MCODA_SKIP_CLI_CHECKS")
}
