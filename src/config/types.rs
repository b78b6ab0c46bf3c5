//! Tablet configuration types. Durations are written as milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// (De)serialize a `Duration` as integer milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db_name: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db_name: "tablet".into(),
        }
    }
}

/// Per-workload timeouts. Zero means no limit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadTimeouts {
    #[serde(with = "millis")]
    pub query_timeout: Duration,
    #[serde(with = "millis")]
    pub tx_timeout: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub max_cap: usize,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 16,
            max_cap: 16,
            idle_timeout: Duration::from_secs(30 * 60),
            max_lifetime: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        PoolConfig {
            capacity,
            max_cap: capacity,
            ..PoolConfig::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    pub db: DbConfig,
    pub oltp: WorkloadTimeouts,
    pub olap: WorkloadTimeouts,
    pub pool: PoolConfig,
    pub stream_pool: PoolConfig,
    pub tx_pool: PoolConfig,
    #[serde(with = "millis")]
    pub transition_grace_period: Duration,
    #[serde(with = "millis")]
    pub shutdown_grace_period: Duration,
    #[serde(with = "millis")]
    pub timebomb: Duration,
    #[serde(with = "millis")]
    pub transition_retry_interval: Duration,
    #[serde(with = "millis")]
    pub check_mysql_delay: Duration,
    #[serde(with = "millis")]
    pub health_check_interval: Duration,
    /// Replication lag above which a non-primary goes unhealthy. Zero disables the check.
    #[serde(with = "millis")]
    pub replication_unhealthy_threshold: Duration,
    pub terse_errors: bool,
    pub sanitize_log_messages: bool,
    /// Maximum length of SQL/bind-variable text in error logs. Zero keeps everything.
    pub truncate_error_len: usize,
    pub table_acl_file: Option<String>,
    pub listen_addr: String,
}

impl Default for TabletConfig {
    fn default() -> Self {
        TabletConfig {
            db: DbConfig::default(),
            oltp: WorkloadTimeouts {
                query_timeout: Duration::from_secs(30),
                tx_timeout: Duration::from_secs(30),
            },
            olap: WorkloadTimeouts {
                query_timeout: Duration::ZERO,
                tx_timeout: Duration::from_secs(30),
            },
            pool: PoolConfig::default(),
            stream_pool: PoolConfig::with_capacity(200),
            tx_pool: PoolConfig::with_capacity(20),
            transition_grace_period: Duration::ZERO,
            shutdown_grace_period: Duration::ZERO,
            timebomb: Duration::from_secs(10 * 60),
            transition_retry_interval: Duration::from_secs(1),
            check_mysql_delay: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(20),
            replication_unhealthy_threshold: Duration::ZERO,
            terse_errors: false,
            sanitize_log_messages: false,
            truncate_error_len: 0,
            table_acl_file: None,
            listen_addr: "127.0.0.1:15100".into(),
        }
    }
}

impl TabletConfig {
    /// Transaction timeout for the given workload; DBA and unspecified use OLTP.
    pub fn tx_timeout_for(&self, workload: crate::target::Workload) -> Duration {
        match workload {
            crate::target::Workload::Olap => self.olap.tx_timeout,
            _ => self.oltp.tx_timeout,
        }
    }
}
