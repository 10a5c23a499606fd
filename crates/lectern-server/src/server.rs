use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use lectern_queue::TaskExecutor;
use lectern_store::sessions::SessionRepo;
use lectern_store::Database;

use crate::handlers::{self, AppState};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            upload_dir: PathBuf::from("uploads"),
            request_timeout_secs: 60,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/files/upload", post(handlers::upload_file))
        .route("/v1/files/query", post(handlers::query_files))
        .route("/v1/files/session/{id}", delete(handlers::close_session))
        .route("/v1/task/{id}", get(handlers::get_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    executor: Arc<TaskExecutor>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        sessions: Arc::new(SessionRepo::new(db)),
        executor,
        upload_dir: config.upload_dir.clone(),
    };

    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "lectern server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()` — dropping it does not stop the server task,
/// but the port is needed to reach it.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
