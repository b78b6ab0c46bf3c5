//! Tablet core: the query-serving side of a sharded MySQL tablet.
//!
//! A [`TabletServer`] owns a [`StateManager`] that sequences its subcomponents
//! through serving transitions, pools MySQL connections through
//! [`ResourcePool`], and runs every query RPC inside a request envelope that
//! handles admission, timeouts, panics and error conversion.

pub mod acl;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod pools;
pub mod routes;
pub mod sql;
pub mod state_manager;
pub mod tabletserver;
pub mod target;

pub use acl::{Role, TableAcl};
pub use config::{load_from_env, load_from_file, validate, TabletConfig};
pub use context::RequestContext;
pub use engine::{DbConn, DbConnFactory, DbConnection, QueryEngine, ReplTracker, SchemaEngine, TxEngine};
pub use error::{Code, ConfigError, SqlError, TabletError};
pub use lifecycle::Components;
pub use pools::{Pooled, Resource, ResourceFactory, ResourcePool, Setting};
pub use routes::{common_routes, debug_routes, tablet_routes};
pub use sql::{BindVars, QueryResult};
pub use state_manager::{ServingState, StateManager};
pub use tabletserver::{ExecuteOutcome, TabletServer, TransactionState};
pub use target::{ExecuteOptions, TabletType, Target, Workload};
