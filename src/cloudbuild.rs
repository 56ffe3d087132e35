//! Cloud Build trigger client
//!
//! Runs a preconfigured build trigger through the Cloud Build REST API
//! (`projects.triggers.run`) and folds the HTTP result into a [`BuildOutcome`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::DeployTarget;
use crate::error::DispatchError;
use crate::{BuildConfig, TokenSourceKind};

pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
pub const TOKEN_ENV_VAR: &str = "CLOUD_BUILD_TOKEN";

/// Cached metadata tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// A build the API accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredBuild {
    pub build_id: String,
    pub log_url: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildFailure {
    #[error("build trigger or project not found: {0}")]
    NotFound(String),

    #[error("permission denied by the build API: {0}")]
    PermissionDenied(String),

    #[error("build API rejected our credentials: {0}")]
    Unauthenticated(String),

    #[error("build API rejected the request: {0}")]
    InvalidArgument(String),

    #[error("build API returned HTTP {http_status}: {message}")]
    Upstream { http_status: u16, message: String },

    #[error("could not reach the build API: {0}")]
    Transport(String),

    #[error("unexpected build API response: {0}")]
    MalformedResponse(String),

    #[error("could not obtain an access token: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Triggered(TriggeredBuild),
    Failed(BuildFailure),
}

/// Seam between the request handler and the build service.
#[async_trait]
pub trait BuildTrigger: Send + Sync {
    async fn run_trigger(&self, target: &DeployTarget) -> BuildOutcome;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepoSource<'a> {
    project_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    build: Option<Build>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Build {
    id: Option<String>,
    log_url: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

/// Maps an HTTP status and body from `triggers.run` to an outcome.
pub fn normalize_response(http_status: u16, body: &str) -> BuildOutcome {
    if (200..300).contains(&http_status) {
        let build = serde_json::from_str::<Operation>(body)
            .ok()
            .and_then(|op| op.metadata)
            .and_then(|m| m.build);
        return match build {
            Some(Build {
                id: Some(build_id),
                log_url,
                status,
            }) if !build_id.is_empty() => BuildOutcome::Triggered(TriggeredBuild {
                build_id,
                log_url,
                status,
            }),
            _ => BuildOutcome::Failed(BuildFailure::MalformedResponse(
                "operation has no metadata.build.id".to_string(),
            )),
        };
    }

    let api_error = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error);
    let message = api_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    let status = api_error.and_then(|e| e.status);

    let failure = match (status.as_deref(), http_status) {
        (Some("NOT_FOUND"), _) | (None, 404) => BuildFailure::NotFound(message),
        (Some("PERMISSION_DENIED"), _) | (None, 403) => BuildFailure::PermissionDenied(message),
        (Some("UNAUTHENTICATED"), _) | (None, 401) => BuildFailure::Unauthenticated(message),
        (Some("INVALID_ARGUMENT"), _) | (Some("FAILED_PRECONDITION"), _) | (None, 400) => {
            BuildFailure::InvalidArgument(message)
        }
        _ => BuildFailure::Upstream {
            http_status,
            message,
        },
    };
    BuildOutcome::Failed(failure)
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

enum TokenKind {
    Static(String),
    Metadata { url: String },
}

/// Supplies bearer tokens for the build API.
pub struct TokenProvider {
    kind: TokenKind,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn from_static(token: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Static(token.into()),
            cache: Mutex::new(None),
        }
    }

    pub fn from_metadata(url: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Metadata { url: url.into() },
            cache: Mutex::new(None),
        }
    }

    pub async fn token(&self, http: &reqwest::Client) -> Result<String, BuildFailure> {
        let url = match &self.kind {
            TokenKind::Static(token) => return Ok(token.clone()),
            TokenKind::Metadata { url } => url,
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        debug!("Fetching access token from metadata server");
        let response = http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| BuildFailure::Credentials(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BuildFailure::Credentials(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| BuildFailure::Credentials(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cache = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    /// Drops a cached token so the next call fetches a fresh one.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}

/// Picks the token source named by `[build].token_source`. `env_token` is the
/// value of `CLOUD_BUILD_TOKEN`, if set.
fn token_provider(
    config: &BuildConfig,
    env_token: Option<String>,
) -> Result<TokenProvider, DispatchError> {
    match config.token_source {
        TokenSourceKind::Env => env_token
            .filter(|t| !t.trim().is_empty())
            .map(TokenProvider::from_static)
            .ok_or_else(|| {
                DispatchError::ConfigError(format!(
                    "token_source = \"env\" but {} is not set",
                    TOKEN_ENV_VAR
                ))
            }),
        TokenSourceKind::Metadata => Ok(TokenProvider::from_metadata(
            config
                .metadata_url
                .clone()
                .unwrap_or_else(|| DEFAULT_METADATA_TOKEN_URL.to_string()),
        )),
    }
}

pub struct CloudBuildClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenProvider,
}

impl CloudBuildClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: TokenProvider) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Builds a client from the `[build]` config section and the environment.
    pub fn from_config(config: &BuildConfig) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.get_timeout()))
            .build()
            .map_err(|e| DispatchError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let tokens = token_provider(config, std::env::var(TOKEN_ENV_VAR).ok())?;
        Ok(Self::new(http, config.get_api_base_url(), tokens))
    }

    fn trigger_url(&self, target: &DeployTarget) -> String {
        format!(
            "{}/v1/projects/{}/triggers/{}:run",
            self.base_url, target.environment.project_id, target.service.trigger_id
        )
    }
}

#[async_trait]
impl BuildTrigger for CloudBuildClient {
    async fn run_trigger(&self, target: &DeployTarget) -> BuildOutcome {
        let token = match self.tokens.token(&self.http).await {
            Ok(token) => token,
            Err(failure) => {
                error!("Could not get build API token: {}", failure);
                return BuildOutcome::Failed(failure);
            }
        };

        let url = self.trigger_url(target);
        info!(
            "Running trigger '{}' in project '{}'",
            target.service.trigger_id, target.environment.project_id
        );

        let body = RepoSource {
            project_id: &target.environment.project_id,
            branch_name: target.branch.as_deref(),
        };
        let response = match self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Build API request to {} failed: {}", url, e);
                return BuildOutcome::Failed(BuildFailure::Transport(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return BuildOutcome::Failed(BuildFailure::Transport(e.to_string())),
        };

        let outcome = normalize_response(status, &text);
        match &outcome {
            BuildOutcome::Triggered(build) => {
                info!("Build {} queued for trigger '{}'", build.build_id, target.service.trigger_id)
            }
            BuildOutcome::Failed(BuildFailure::Unauthenticated(_)) => {
                warn!("Build API rejected token, dropping cached credentials");
                self.tokens.invalidate().await;
            }
            BuildOutcome::Failed(failure) => warn!("Trigger run failed: {}", failure),
        }
        outcome
    }
}
