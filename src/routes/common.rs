//! Common routes: liveness, readiness, health query, version.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::DbConnection;
use crate::error::TabletError;
use crate::tabletserver::TabletServer;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    serving: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn ready<C: DbConnection>(
    State(tsv): State<Arc<TabletServer<C>>>,
) -> Result<Json<ReadyBody>, (StatusCode, Json<ReadyBody>)> {
    let serving = tsv.state_manager().is_serving_string();
    if !tsv.is_serving() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyBody {
                status: "degraded",
                serving,
            }),
        ));
    }
    Ok(Json(ReadyBody {
        status: "ok",
        serving,
    }))
}

async fn healthz<C: DbConnection>(
    State(tsv): State<Arc<TabletServer<C>>>,
) -> Result<Json<HealthBody>, TabletError> {
    tsv.is_healthy().await?;
    Ok(Json(HealthBody { status: "ok" }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health, /ready, /healthz, /version.
pub fn common_routes<C: DbConnection>(tsv: Arc<TabletServer<C>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready::<C>))
        .route("/healthz", get(healthz::<C>))
        .route("/version", get(version))
        .with_state(tsv)
}
