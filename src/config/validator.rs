//! Config validation: pool bounds and required fields.

use crate::config::{PoolConfig, TabletConfig};
use crate::error::ConfigError;

pub fn validate(config: &TabletConfig) -> Result<(), ConfigError> {
    if config.db.db_name.trim().is_empty() {
        return Err(ConfigError::Validation("db.db_name is required".into()));
    }
    validate_pool("pool", &config.pool)?;
    validate_pool("stream_pool", &config.stream_pool)?;
    validate_pool("tx_pool", &config.tx_pool)?;
    Ok(())
}

fn validate_pool(name: &str, pool: &PoolConfig) -> Result<(), ConfigError> {
    if pool.capacity == 0 || pool.max_cap == 0 {
        return Err(ConfigError::Validation(format!(
            "{}.capacity and {}.max_cap must be positive",
            name, name
        )));
    }
    if pool.capacity > pool.max_cap {
        return Err(ConfigError::Validation(format!(
            "{}.capacity {} exceeds max_cap {}",
            name, pool.capacity, pool.max_cap
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate(&TabletConfig::default()).expect("valid");
    }

    #[test]
    fn rejects_empty_db_name() {
        let mut c = TabletConfig::default();
        c.db.db_name = " ".into();
        assert!(validate(&c).is_err());
    }

    #[test]
    fn rejects_capacity_over_max_cap() {
        let mut c = TabletConfig::default();
        c.stream_pool.capacity = 300;
        c.stream_pool.max_cap = 200;
        let err = validate(&c).unwrap_err();
        assert!(err.to_string().contains("stream_pool.capacity 300 exceeds max_cap 200"));
    }

    #[test]
    fn rejects_empty_tx_pool() {
        let mut c = TabletConfig::default();
        c.tx_pool.capacity = 0;
        assert!(validate(&c).is_err());
    }
}
