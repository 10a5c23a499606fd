use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lectern_assistant::{AssistantRouter, ResourceOrchestrator};
use lectern_core::provider::AssistantProvider;
use lectern_provider::{PlatformClient, PlatformConfig, PollConfig, PollingClient};
use lectern_queue::{ExecutorConfig, TaskExecutor};
use lectern_server::ServerConfig;
use lectern_store::sessions::SessionRepo;
use lectern_store::Database;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Lectern server");

    // Database
    let db_path = env_or("LECTERN_DB_PATH", "lectern.db");
    let db_path = PathBuf::from(db_path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).expect("Failed to create database directory");
        }
    }
    let db = Database::open(&db_path).expect("Failed to open database");
    tracing::info!(path = %db_path.display(), "Database opened");

    // Assistant platform client
    let platform = PlatformConfig {
        base_uri: std::env::var("PLATFORM_BASE_URI").expect("PLATFORM_BASE_URI is required"),
        api_key: std::env::var("PLATFORM_API_KEY").expect("PLATFORM_API_KEY is required"),
    };
    let provider: Arc<dyn AssistantProvider> = Arc::new(PlatformClient::new(platform));

    let poller = PollingClient::new(PollConfig {
        interval: Duration::from_secs(env_parse("PLATFORM_POLL_INTERVAL_SECS", 5)),
        timeout: Duration::from_secs(env_parse("PLATFORM_POLL_TIMEOUT_SECS", 120)),
    });

    let orchestrator = ResourceOrchestrator::new(
        provider,
        SessionRepo::new(db.clone()),
        poller,
        lectern_assistant::DEFAULT_RUN_RETRIES,
    );

    // Task workers
    let executor = TaskExecutor::new(
        db.clone(),
        Arc::new(AssistantRouter::new(orchestrator)),
        ExecutorConfig {
            workers: env_parse("LECTERN_WORKERS", 2),
            ..Default::default()
        },
    );
    let _workers = executor.spawn_workers();

    // HTTP server
    let config = ServerConfig {
        port: env_parse("LECTERN_PORT", 8000),
        upload_dir: PathBuf::from(env_or("LECTERN_UPLOAD_DIR", "uploads")),
        ..Default::default()
    };
    let _handle = lectern_server::start(config, db, executor)
        .await
        .expect("Failed to start server");

    tracing::info!("Lectern server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
