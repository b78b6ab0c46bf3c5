//! Debug routes exposing counters and in-flight queries.

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::engine::DbConnection;
use crate::tabletserver::{DebugVars, QueryLists, TabletServer};

async fn vars<C: DbConnection>(State(tsv): State<Arc<TabletServer<C>>>) -> Json<DebugVars> {
    Json(tsv.debug_vars())
}

async fn query_list<C: DbConnection>(State(tsv): State<Arc<TabletServer<C>>>) -> Json<QueryLists> {
    Json(tsv.query_lists())
}

/// GET /debug/vars, /debug/querylist.
pub fn debug_routes<C: DbConnection>(tsv: Arc<TabletServer<C>>) -> Router {
    Router::new()
        .route("/debug/vars", get(vars::<C>))
        .route("/debug/querylist", get(query_list::<C>))
        .with_state(tsv)
}
