//! Configuration for postpay.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (POSTPAY_HOME, POSTPAY_STORE, ...)
//! 2. Config file (.postpay/config.yaml)
//! 3. Defaults (~/.postpay, file store, 3 attempts / 1000ms)
//!
//! Config file discovery:
//! - Searches current directory and parents for .postpay/config.yaml
//! - Paths in config file are relative to the .postpay/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub integrations: Option<IntegrationsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .postpay/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<StoreBackend>,
    /// JSON document path (relative to .postpay/)
    pub path: Option<String>,
    /// SQLite database path (relative to .postpay/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntegrationsConfig {
    pub community_webhook_url: Option<String>,
    pub crm_endpoint: Option<String>,
    pub crm_api_key: Option<String>,
    pub request_timeout_seconds: Option<u64>,
}

/// Which store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(StoreBackend::File),
            "sqlite" | "db" => Ok(StoreBackend::Sqlite),
            other => anyhow::bail!("Unknown store backend: {}", other),
        }
    }
}

/// Resolved store location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: PathBuf,
    pub database: PathBuf,
}

/// Outbound integration endpoints; `None` means not configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationSettings {
    pub community_webhook_url: Option<String>,
    pub crm_endpoint: Option<String>,
    pub crm_api_key: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            community_webhook_url: None,
            crm_endpoint: None,
            crm_api_key: None,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to postpay home (store files)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store: StoreSettings,
    pub retry: RetryPolicy,
    pub integrations: IntegrationSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".postpay").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Parse a numeric environment value; garbage is an error, not a silent default
fn parse_env<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid {} value {:?}: {}", name, raw, e))
        })
        .transpose()
}

/// Combine a parsed config file, default home, and an environment lookup
fn resolve<E>(
    file: Option<(&Path, ConfigFile)>,
    default_home: PathBuf,
    env: E,
) -> Result<ResolvedConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), Some(config)),
        None => (None, None),
    };
    // Relative paths in the file resolve against the .postpay/ directory
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let from_file = |value: Option<&String>| -> Option<PathBuf> {
        let value = value?;
        Some(match &config_dir {
            Some(dir) => resolve_path(dir, value),
            None => PathBuf::from(value),
        })
    };

    let store_config = config
        .as_ref()
        .and_then(|c| c.store.clone())
        .unwrap_or_default();
    let integrations_config = config
        .as_ref()
        .and_then(|c| c.integrations.clone())
        .unwrap_or_default();

    // Home
    let home = env("POSTPAY_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(config.as_ref().and_then(|c| c.paths.home.as_ref())))
        .unwrap_or(default_home);

    // Store
    let env_database = env("POSTPAY_DATABASE").map(PathBuf::from);
    let backend = match env("POSTPAY_STORE") {
        Some(raw) => raw.parse()?,
        None if env_database.is_some() => StoreBackend::Sqlite,
        None => store_config.backend.unwrap_or(StoreBackend::File),
    };
    let path = env("POSTPAY_STORE_PATH")
        .map(PathBuf::from)
        .or_else(|| from_file(store_config.path.as_ref()))
        .unwrap_or_else(|| home.join("pipelines.json"));
    let database = env_database
        .or_else(|| from_file(store_config.database.as_ref()))
        .unwrap_or_else(|| home.join("pipelines.db"));

    // Retry
    let file_retry = config
        .as_ref()
        .and_then(|c| c.retry)
        .unwrap_or_default();
    let retry = RetryPolicy::new(
        parse_env("POSTPAY_RETRY_COUNT", env("POSTPAY_RETRY_COUNT"))?
            .unwrap_or(file_retry.max_attempts),
        parse_env("POSTPAY_RETRY_BASE_MS", env("POSTPAY_RETRY_BASE_MS"))?
            .unwrap_or(file_retry.base_delay_ms),
    );

    // Integrations
    let integrations = IntegrationSettings {
        community_webhook_url: env("POSTPAY_COMMUNITY_WEBHOOK_URL")
            .or(integrations_config.community_webhook_url),
        crm_endpoint: env("POSTPAY_CRM_ENDPOINT").or(integrations_config.crm_endpoint),
        crm_api_key: env("POSTPAY_CRM_API_KEY").or(integrations_config.crm_api_key),
        request_timeout_seconds: parse_env(
            "POSTPAY_REQUEST_TIMEOUT_SECS",
            env("POSTPAY_REQUEST_TIMEOUT_SECS"),
        )?
        .or(integrations_config.request_timeout_seconds)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        store: StoreSettings {
            backend,
            path,
            database,
        },
        retry,
        integrations,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".postpay");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    resolve(
        file.as_ref().map(|(path, config)| (path.as_path(), config.clone())),
        default_home,
        |name| std::env::var(name).ok(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
