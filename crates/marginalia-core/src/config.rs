use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    coordinator::DEFAULT_BACKOFF, outbox::DEFAULT_MAX_ATTEMPTS,
    thread::DEFAULT_ORPHAN_RETRY_LIMIT,
};

/// Directory holding the project config and the default data directory.
pub const PROJECT_DIR: &str = ".marginalia";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub threading: ThreadingConfig,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// Review id used when `--review` is not given.
    #[serde(default)]
    pub review: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            review: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_interval_secs")]
    pub interval_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_fetch_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadingConfig {
    #[serde(default = "default_orphan_retry_limit")]
    pub orphan_retry_limit: u32,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            orphan_retry_limit: default_orphan_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
    /// Server used when the project config names none.
    #[serde(default)]
    pub server: Option<String>,
}

/// Values read from `MARGINALIA_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub server: Option<String>,
    pub review: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub format: Option<String>,
}

impl EnvOverrides {
    #[must_use]
    pub fn from_env() -> Self {
        let non_empty = |key: &str| env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            server: non_empty("MARGINALIA_SERVER"),
            review: non_empty("MARGINALIA_REVIEW"),
            data_dir: non_empty("MARGINALIA_DATA_DIR").map(PathBuf::from),
            format: non_empty("FORMAT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub project: ProjectConfig,
    pub user: UserConfig,
    pub resolved_output: String,
    pub server_url: Option<String>,
    pub review_id: Option<String>,
    pub data_dir: PathBuf,
}

impl EffectiveConfig {
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_secs(self.project.delivery.backoff_secs)
    }

    #[must_use]
    pub const fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.project.fetch.interval_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.project.server.connect_timeout_secs)
    }
}

/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(PROJECT_DIR).join("config.toml");
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("marginalia/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load both config files and layer CLI flags and environment on top.
///
/// Precedence, highest first: CLI flags, environment, project file, user file.
///
/// # Errors
///
/// Returns an error if a config file is malformed.
pub fn resolve_config(
    project_root: &Path,
    cli_json: bool,
    cli_review: Option<&str>,
) -> Result<EffectiveConfig> {
    let project = load_project_config(project_root)?;
    let user = load_user_config()?;
    Ok(layer(
        project_root,
        project,
        user,
        EnvOverrides::from_env(),
        cli_json,
        cli_review,
    ))
}

fn layer(
    project_root: &Path,
    project: ProjectConfig,
    user: UserConfig,
    env: EnvOverrides,
    cli_json: bool,
    cli_review: Option<&str>,
) -> EffectiveConfig {
    let resolved_output = resolve_output(cli_json, user.output.clone(), env.format);
    let server_url = env
        .server
        .or_else(|| project.server.url.clone())
        .or_else(|| user.server.clone());
    let review_id = cli_review
        .map(str::to_string)
        .or(env.review)
        .or_else(|| project.server.review.clone());
    let data_dir = env
        .data_dir
        .or_else(|| project.data_dir.clone())
        .map_or_else(
            || project_root.join(PROJECT_DIR),
            |dir| {
                if dir.is_absolute() {
                    dir
                } else {
                    project_root.join(dir)
                }
            },
        );

    EffectiveConfig {
        project,
        user,
        resolved_output,
        server_url,
        review_id,
        data_dir,
    }
}

fn resolve_output(cli_json: bool, user_output: Option<String>, env_format: Option<String>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_backoff_secs() -> u64 {
    DEFAULT_BACKOFF.as_secs()
}

const fn default_fetch_interval_secs() -> u64 {
    60
}

const fn default_orphan_retry_limit() -> u32 {
    DEFAULT_ORPHAN_RETRY_LIMIT
}
