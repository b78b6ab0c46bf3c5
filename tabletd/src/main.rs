//! Runs one tablet over the MySQL described by `TABLET_*` variables and serves
//! its health and debug routes.
//!
//! The tablet identity comes from `TABLET_KEYSPACE` (defaults to the database
//! name), `TABLET_SHARD` (default `0`) and `TABLET_TYPE` (default `PRIMARY`).

use std::sync::Arc;
use tablet_core::{
    load_from_env, tablet_routes, Components, DbConn, DbConnFactory, ReplTracker, ResourceFactory,
    SchemaEngine, TabletServer, TabletType, Target,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tablet_core=info,tabletd=info")),
        )
        .init();

    let config = load_from_env()?;
    let keyspace = std::env::var("TABLET_KEYSPACE").unwrap_or_else(|_| config.db.db_name.clone());
    let shard = std::env::var("TABLET_SHARD").unwrap_or_else(|_| "0".into());
    let tablet_type: TabletType = std::env::var("TABLET_TYPE")
        .unwrap_or_else(|_| "PRIMARY".into())
        .parse()?;

    let components = Components {
        se: Arc::new(SchemaEngine::new(&config.db)),
        rt: Arc::new(ReplTracker::new(&config.db)),
        ..Components::default()
    };
    let factory: Arc<dyn ResourceFactory<DbConn>> = Arc::new(DbConnFactory::new(&config.db));
    let listen_addr = config.listen_addr.clone();
    let tsv = TabletServer::new(config, factory, components).await?;
    tsv.init(Target::new(keyspace, shard, tablet_type)).await?;
    if let Err(e) = tsv.set_serving_type(tablet_type, None, true, "startup").await {
        tracing::warn!(error = %e, "initial transition failed; retrying in background");
    }

    let app = tablet_routes(tsv.clone());
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!("tabletd listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    tracing::info!("shutting down");
    tsv.stop_service().await;
    Ok(())
}
