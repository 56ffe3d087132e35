pub mod api;
pub mod audit;
pub mod auth;
pub mod cloudbuild;
pub mod command;
pub mod db;
pub mod error;
pub mod logging;
pub mod rate_limit;
pub mod reply;
pub mod signature;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;

use crate::audit::AuditSink;
use crate::cloudbuild::BuildTrigger;
use crate::db::SqlAuditStore;
use crate::error::DispatchError;
use crate::rate_limit::RateLimiter;
use crate::reply::ReplySender;

pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: u64 = 300;
pub const DEFAULT_RATE_LIMIT: usize = 10;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
pub const DEFAULT_BUILD_API_BASE_URL: &str = "https://cloudbuild.googleapis.com";
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDescriptor>,
    #[serde(default, rename = "environment")]
    pub environments: Vec<EnvironmentDescriptor>,
}

/// How the final result of a deploy command reaches the user.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Acknowledge at once, post the outcome to the response_url later.
    #[default]
    Deferred,
    /// Wait for the build API and answer in the HTTP response.
    Sync,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub reply_mode: ReplyMode,
    pub signature_tolerance_secs: Option<u64>,
    pub rate_limit: Option<usize>,
    pub rate_limit_window_secs: Option<u64>,
}

impl ServerConfig {
    pub fn get_signature_tolerance(&self) -> u64 {
        self.signature_tolerance_secs
            .unwrap_or(DEFAULT_SIGNATURE_TOLERANCE_SECS)
    }

    pub fn get_rate_limit(&self) -> usize {
        self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT)
    }

    pub fn get_rate_limit_window(&self) -> u64 {
        self.rate_limit_window_secs
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub allowed_user_ids: Vec<String>,
    #[serde(default)]
    pub allowed_team_ids: Vec<String>,
}

/// Where the build client gets its OAuth access token.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenSourceKind {
    /// GCE / Cloud Run metadata server.
    #[default]
    Metadata,
    /// Static token from the `CLOUD_BUILD_TOKEN` environment variable.
    Env,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BuildConfig {
    pub api_base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub token_source: TokenSourceKind,
    pub metadata_url: Option<String>,
}

impl BuildConfig {
    pub fn get_api_base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_BUILD_API_BASE_URL)
            .trim_end_matches('/')
    }

    pub fn get_timeout(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_BUILD_TIMEOUT_SECS)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    pub database_path: Option<PathBuf>,
}

/// A deployable service: short alias to build trigger.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub alias: String,
    pub name: String,
    pub trigger_id: String,
    /// Environment aliases this service may be deployed to. `None` means all.
    pub environments: Option<Vec<String>>,
}

impl ServiceDescriptor {
    /// Returns true if the service may be deployed to the given environment alias.
    pub fn allows_environment(&self, env_alias: &str) -> bool {
        match &self.environments {
            Some(allowed) => allowed.iter().any(|e| e.eq_ignore_ascii_case(env_alias)),
            None => true,
        }
    }
}

/// A target environment: short alias to cloud project.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnvironmentDescriptor {
    pub alias: String,
    pub name: String,
    pub project_id: String,
}

impl DispatchConfig {
    /// Finds a service by alias, ignoring ASCII case.
    pub fn find_service(&self, alias: &str) -> Option<&ServiceDescriptor> {
        self.services
            .iter()
            .find(|s| s.alias.eq_ignore_ascii_case(alias))
    }

    /// Finds an environment by alias, ignoring ASCII case.
    pub fn find_environment(&self, alias: &str) -> Option<&EnvironmentDescriptor> {
        self.environments
            .iter()
            .find(|e| e.alias.eq_ignore_ascii_case(alias))
    }

    /// Checks the lookup tables for duplicates, dangling references and empty ids.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.server.get_rate_limit() == 0 || self.server.get_rate_limit_window() == 0 {
            return Err(DispatchError::ConfigError(
                "rate_limit and rate_limit_window_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            check_alias("environment", &env.alias)?;
            if env.project_id.trim().is_empty() {
                return Err(DispatchError::ConfigError(format!(
                    "environment '{}' has an empty project_id",
                    env.alias
                )));
            }
            if !seen.insert(env.alias.to_ascii_lowercase()) {
                return Err(DispatchError::ConfigError(format!(
                    "duplicate environment alias '{}'",
                    env.alias
                )));
            }
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            check_alias("service", &service.alias)?;
            if service.trigger_id.trim().is_empty() {
                return Err(DispatchError::ConfigError(format!(
                    "service '{}' has an empty trigger_id",
                    service.alias
                )));
            }
            if !seen.insert(service.alias.to_ascii_lowercase()) {
                return Err(DispatchError::ConfigError(format!(
                    "duplicate service alias '{}'",
                    service.alias
                )));
            }
            if let Some(envs) = &service.environments {
                if let Some(unknown) = envs.iter().find(|e| self.find_environment(e).is_none()) {
                    return Err(DispatchError::ConfigError(format!(
                        "service '{}' references unknown environment '{}'",
                        service.alias, unknown
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Aliases are matched against single whitespace-separated words.
fn check_alias(kind: &str, alias: &str) -> Result<(), DispatchError> {
    if alias.is_empty() || alias.chars().any(char::is_whitespace) {
        return Err(DispatchError::ConfigError(format!(
            "{} alias {:?} must be a single non-empty word",
            kind, alias
        )));
    }
    Ok(())
}

/// Parse and validate configuration text
pub fn parse_config(config_str: &str) -> Result<DispatchConfig, DispatchError> {
    let config: DispatchConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Load and parse the configuration file
pub fn load_config(path: &Path) -> Result<DispatchConfig, DispatchError> {
    let config_str = std::fs::read_to_string(path).map_err(|e| {
        DispatchError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    parse_config(&config_str)
}

/// Re-read the configuration file without blocking the runtime
pub async fn reload_config(path: &Path) -> Result<DispatchConfig, DispatchError> {
    let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        DispatchError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    parse_config(&config_str)
}

pub struct AppState {
    pub config: RwLock<Arc<DispatchConfig>>,
    pub config_path: PathBuf,
    pub signing_secret: String,
    pub builds: Arc<dyn BuildTrigger>,
    pub audit: Arc<dyn AuditSink>,
    pub audit_store: Option<SqlAuditStore>,
    pub replies: ReplySender,
    pub rate_limiter: Mutex<RateLimiter>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Current configuration. Requests hold on to the snapshot they started with.
    pub fn config_snapshot(&self) -> Arc<DispatchConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace_config(&self, config: DispatchConfig) {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
    }
}

pub type SharedState = Arc<AppState>;
