//! Generic resource pooling.

mod resource_pool;
mod setting;

pub use resource_pool::*;
pub use setting::Setting;
