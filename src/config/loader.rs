//! Load config from a JSON file, a JSON string, or `TABLET_*` environment variables.

use crate::config::{validate, TabletConfig};
use crate::error::ConfigError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub fn from_json_str(s: &str) -> Result<TabletConfig, ConfigError> {
    let config: TabletConfig =
        serde_json::from_str(s).map_err(|e| ConfigError::Load(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

pub fn load_from_file(path: impl AsRef<Path>) -> Result<TabletConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    from_json_str(&raw)
}

/// Defaults overlaid with whatever `TABLET_*` variables are set.
pub fn load_from_env() -> Result<TabletConfig, ConfigError> {
    let mut c = match std::env::var("TABLET_CONFIG_FILE") {
        Ok(path) => load_from_file(path)?,
        Err(_) => TabletConfig::default(),
    };
    set_string("TABLET_DB_HOST", &mut c.db.host);
    set_parsed("TABLET_DB_PORT", &mut c.db.port)?;
    set_string("TABLET_DB_USER", &mut c.db.user);
    set_string("TABLET_DB_PASSWORD", &mut c.db.password);
    set_string("TABLET_DB_NAME", &mut c.db.db_name);
    set_millis("TABLET_OLTP_QUERY_TIMEOUT_MS", &mut c.oltp.query_timeout)?;
    set_millis("TABLET_OLTP_TX_TIMEOUT_MS", &mut c.oltp.tx_timeout)?;
    set_millis("TABLET_OLAP_QUERY_TIMEOUT_MS", &mut c.olap.query_timeout)?;
    set_millis("TABLET_OLAP_TX_TIMEOUT_MS", &mut c.olap.tx_timeout)?;
    set_parsed("TABLET_POOL_SIZE", &mut c.pool.capacity)?;
    set_parsed("TABLET_POOL_MAX_CAP", &mut c.pool.max_cap)?;
    set_millis("TABLET_POOL_IDLE_TIMEOUT_MS", &mut c.pool.idle_timeout)?;
    set_millis("TABLET_POOL_MAX_LIFETIME_MS", &mut c.pool.max_lifetime)?;
    set_parsed("TABLET_TX_POOL_SIZE", &mut c.tx_pool.capacity)?;
    set_parsed("TABLET_TX_POOL_MAX_CAP", &mut c.tx_pool.max_cap)?;
    set_millis("TABLET_TRANSITION_GRACE_PERIOD_MS", &mut c.transition_grace_period)?;
    set_millis("TABLET_SHUTDOWN_GRACE_PERIOD_MS", &mut c.shutdown_grace_period)?;
    set_millis("TABLET_TIMEBOMB_MS", &mut c.timebomb)?;
    set_millis("TABLET_HEALTH_CHECK_INTERVAL_MS", &mut c.health_check_interval)?;
    set_parsed("TABLET_TERSE_ERRORS", &mut c.terse_errors)?;
    set_parsed("TABLET_SANITIZE_LOG_MESSAGES", &mut c.sanitize_log_messages)?;
    if let Ok(v) = std::env::var("TABLET_TABLE_ACL_FILE") {
        c.table_acl_file = Some(v);
    }
    set_string("TABLET_LISTEN_ADDR", &mut c.listen_addr);
    validate(&c)?;
    Ok(c)
}

fn set_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn set_parsed<T: FromStr>(key: &'static str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(v) = std::env::var(key) {
        *target = v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v.clone() })?;
    }
    Ok(())
}

fn set_millis(key: &'static str, target: &mut Duration) -> Result<(), ConfigError> {
    let mut ms = target.as_millis() as u64;
    set_parsed(key, &mut ms)?;
    *target = Duration::from_millis(ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_overrides_defaults() {
        let c = from_json_str(
            r#"{
                "db": {"db_name": "commerce"},
                "pool": {"capacity": 4, "max_cap": 8, "idle_timeout": 1500},
                "shutdown_grace_period": 250,
                "terse_errors": true
            }"#,
        )
        .expect("config");
        assert_eq!(c.db.db_name, "commerce");
        assert_eq!(c.db.port, 3306);
        assert_eq!(c.pool.capacity, 4);
        assert_eq!(c.pool.max_cap, 8);
        assert_eq!(c.pool.idle_timeout, Duration::from_millis(1500));
        assert_eq!(c.shutdown_grace_period, Duration::from_millis(250));
        assert!(c.terse_errors);
        assert_eq!(c.oltp.query_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_json_is_a_load_error() {
        let err = from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn loaded_config_is_validated() {
        let err = from_json_str(r#"{"pool": {"capacity": 9, "max_cap": 2}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
