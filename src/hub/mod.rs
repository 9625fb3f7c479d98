//! Control Surface (C7): an axum router exposing `acquire`/`stats`, grounded
//! on this codebase's `hub::create_router` CORS+tracing construction with the
//! auth middleware and the 30-odd mihomo endpoints dropped.

use crate::pool::BindingTable;
use crate::statistic::{StatsSnapshot, Statistics};
use crate::{PoolError, Result, VERSION};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// State shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<BindingTable>,
    pub stats: Arc<Statistics>,
}

/// Build the control-surface router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/acquire", get(acquire))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the control surface until the listener is dropped.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let router = create_router(state);
    info!(%addr, "control surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .await
        .map_err(|e| PoolError::internal(format!("control surface serve failed: {}", e)))?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "proxy-pool" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

/// `GET /acquire`: hand out a (port, generation) the caller may now connect to.
async fn acquire(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.table.reserve_ready_port() {
        Ok((port, _generation)) => {
            state.stats.record_handed_out();
            (
                StatusCode::OK,
                Json(json!({ "endpoint": format!("127.0.0.1:{}", port) })),
            )
        }
        Err(PoolError::NoReady) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no ready port available", "retry": true })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// `GET /stats`: a JSON snapshot of all counters plus the binding table's gauges.
async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot(&state.table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RemoteRegistry;

    fn state() -> AppState {
        let registry = Arc::new(RemoteRegistry::from_str("r1.example 1080 a b\n").unwrap());
        let table = Arc::new(BindingTable::new(10000, 1, registry));
        AppState {
            table,
            stats: Arc::new(Statistics::new()),
        }
    }

    #[tokio::test]
    async fn test_hello() {
        let response = hello().await;
        assert_eq!(response.0["hello"], "proxy-pool");
    }

    #[tokio::test]
    async fn test_version() {
        let response = version().await;
        assert_eq!(response.0["version"], VERSION);
    }

    #[tokio::test]
    async fn test_acquire_returns_no_ready_when_nothing_is_bound() {
        let (status, body) = acquire(State(state())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0["retry"], true);
    }

    #[tokio::test]
    async fn test_acquire_returns_endpoint_once_bound() {
        let s = state();
        s.table.rebind(10000);
        let (status, body) = acquire(State(s.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["endpoint"], "127.0.0.1:10000");

        let (status2, _) = acquire(State(s)).await;
        assert_eq!(status2, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_reflects_handed_out_counter() {
        let s = state();
        s.table.rebind(10000);
        acquire(State(s.clone())).await;
        let snapshot = stats(State(s)).await;
        assert_eq!(snapshot.0.handed_out, 1);
    }
}
