//! Tablet configuration: types, loading from JSON or `TABLET_*` variables,
//! and validation.

mod loader;
mod types;
mod validator;

pub use loader::{from_json_str, load_from_env, load_from_file};
pub use types::{DbConfig, PoolConfig, TabletConfig, WorkloadTimeouts};
pub use validator::validate;
