//! HTTP routes served next to the tablet.

mod common;
mod debug;

pub use common::common_routes;
pub use debug::debug_routes;

use axum::Router;
use std::sync::Arc;

use crate::engine::DbConnection;
use crate::tabletserver::TabletServer;

/// Every route, merged.
pub fn tablet_routes<C: DbConnection>(tsv: Arc<TabletServer<C>>) -> Router {
    common_routes(tsv.clone()).merge(debug_routes(tsv))
}
