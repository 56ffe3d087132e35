use chrono::Utc;
use slash_deploy::api::build_router;
use slash_deploy::audit::{AuditSink, FanoutAuditSink, TracingAuditSink};
use slash_deploy::cloudbuild::CloudBuildClient;
use slash_deploy::db::{SqlAuditStore, init_db};
use slash_deploy::error::DispatchError;
use slash_deploy::logging::setup_logging;
use slash_deploy::rate_limit::RateLimiter;
use slash_deploy::reply::ReplySender;
use slash_deploy::{AppState, load_config};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{self, error, info, warn};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_CONFIG_PATH: &str = "slash_deploy.toml";
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").ok().map(PathBuf::from);
    let _log_guards = match setup_logging(log_dir.as_deref()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Logging error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DispatchError> {
    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path = PathBuf::from(
        std::env::var("SLASH_DEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );

    let config = load_config(&config_path)?;
    if config.auth.allowed_user_ids.is_empty() {
        warn!("allowed_user_ids is empty; every deploy command will be denied");
    }

    let signing_secret = std::env::var("SLACK_SIGNING_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| DispatchError::ConfigError("SLACK_SIGNING_SECRET is not set".to_string()))?;

    let builds = Arc::new(CloudBuildClient::from_config(&config.build)?);

    let audit_store = match &config.audit.database_path {
        Some(path) => Some(SqlAuditStore::new(init_db(path).await?)),
        None => None,
    };
    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(store) = &audit_store {
        sinks.push(Arc::new(store.clone()));
    }

    let state = Arc::new(AppState {
        config: RwLock::new(Arc::new(config)),
        config_path: config_path.clone(),
        signing_secret,
        builds,
        audit: Arc::new(FanoutAuditSink::new(sinks)),
        audit_store,
        replies: ReplySender::with_timeout(REPLY_TIMEOUT)?,
        rate_limiter: Mutex::new(RateLimiter::new()),
        start_time: Instant::now(),
        started_at: Utc::now(),
    });

    let app = build_router(state);

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
